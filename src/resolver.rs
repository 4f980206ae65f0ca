//! Resolver transport client: DNS-over-HTTPS and DNS-over-TLS.

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::codec::{self, DnsAnswer, RawPayload, StreamFrameAccumulator};
use crate::config::ResolverConfig;
use crate::error::ProbeError;
use crate::metrics::{self, Timer};

/// Default DNS-over-TLS port.
pub const DOT_DEFAULT_PORT: u16 = 853;

const DNS_MESSAGE: &str = "application/dns-message";
const DNS_JSON: &str = "application/dns-json";

/// Where and how to send a query. The scheme selects the transport.
///
/// - `https://host/path`: DoH with binary `application/dns-message`
/// - `json+https://host/path`: DoH with the `application/dns-json` envelope
/// - `tls://host[:port]`: DoT, port defaults to 853
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolverEndpoint {
    /// Binary DNS-over-HTTPS.
    Https(Url),
    /// JSON DNS-over-HTTPS.
    HttpsJson(Url),
    /// DNS-over-TLS.
    Tls {
        /// Host name, also used for certificate verification.
        host: String,
        /// TCP port.
        port: u16,
    },
}

impl ResolverEndpoint {
    /// Short transport label for logs and metrics.
    pub fn transport(&self) -> &'static str {
        match self {
            ResolverEndpoint::Https(_) => "doh",
            ResolverEndpoint::HttpsJson(_) => "doh_json",
            ResolverEndpoint::Tls { .. } => "dot",
        }
    }
}

impl fmt::Display for ResolverEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverEndpoint::Https(url) => write!(f, "{url}"),
            ResolverEndpoint::HttpsJson(url) => write!(f, "json+{url}"),
            ResolverEndpoint::Tls { host, port } => write!(f, "tls://{host}:{port}"),
        }
    }
}

impl FromStr for ResolverEndpoint {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ProbeError::InvalidResolver(s.to_string());

        if let Some(rest) = s.strip_prefix("json+") {
            let url = Url::parse(rest).map_err(|_| invalid())?;
            if url.scheme() != "https" {
                return Err(invalid());
            }
            return Ok(ResolverEndpoint::HttpsJson(url));
        }

        let url = Url::parse(s).map_err(|_| invalid())?;
        match url.scheme() {
            "https" => Ok(ResolverEndpoint::Https(url)),
            "tls" => {
                let host = url.host_str().ok_or_else(invalid)?;
                let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
                Ok(ResolverEndpoint::Tls {
                    host,
                    port: url.port().unwrap_or(DOT_DEFAULT_PORT),
                })
            }
            _ => Err(invalid()),
        }
    }
}

/// Cancellation side of a [`CancelSignal`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<Option<String>>,
}

impl CancelHandle {
    /// Cancel every operation holding the paired signal.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Some(reason.into()));
    }
}

/// Caller-supplied cancellation carrying a reason.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<Option<String>>>,
}

impl CancelSignal {
    /// Create a linked handle and signal.
    pub fn pair() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(None);
        (CancelHandle { tx }, CancelSignal { rx: Some(rx) })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Reason, if already cancelled.
    pub fn reason(&self) -> Option<String> {
        self.rx.as_ref().and_then(|rx| rx.borrow().clone())
    }

    /// Resolves with the reason once cancelled; pends forever otherwise.
    pub async fn cancelled(&mut self) -> String {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

/// Race `fut` against cancellation and a deadline. Cancellation wins ties.
///
/// `fut` is dropped on cancellation, which closes any socket it owns.
pub async fn with_cancellation<T, F>(
    mut cancel: CancelSignal,
    deadline: Duration,
    fut: F,
) -> Result<T, ProbeError>
where
    F: Future<Output = Result<T, ProbeError>>,
{
    tokio::select! {
        biased;

        reason = cancel.cancelled() => Err(ProbeError::Cancelled(reason)),
        _ = tokio::time::sleep(deadline) => Err(ProbeError::Cancelled(format!(
            "deadline of {}ms exceeded",
            deadline.as_millis()
        ))),
        result = fut => result,
    }
}

/// Anything able to run one resolution.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Resolve `name`/`record_type` against `endpoint`.
    async fn resolve(
        &self,
        endpoint: &ResolverEndpoint,
        name: &str,
        record_type: RecordType,
        cancel: CancelSignal,
    ) -> Result<Vec<DnsAnswer>, ProbeError>;
}

#[derive(Debug, Deserialize)]
struct JsonEnvelope {
    #[serde(rename = "Answer", default)]
    answer: Vec<JsonAnswer>,
}

#[derive(Debug, Deserialize)]
struct JsonAnswer {
    name: String,
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
    #[serde(rename = "TTL", default)]
    ttl: u32,
}

/// DoH/DoT client shared by all actors in a process.
#[derive(Clone)]
pub struct DnsClient {
    http: reqwest::Client,
    tls: TlsConnector,
    deadline: Duration,
}

impl DnsClient {
    /// Build a client with the system's web PKI roots.
    pub fn new(config: &ResolverConfig) -> Result<Self, ProbeError> {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(config, roots)
    }

    /// Build a client whose DoT connections trust only `roots`.
    pub fn with_roots(config: &ResolverConfig, roots: RootCertStore) -> Result<Self, ProbeError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;

        let tls_config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self {
            http,
            tls: TlsConnector::from(Arc::new(tls_config)),
            deadline: Duration::from_millis(config.timeout_ms),
        })
    }

    async fn query_https(&self, url: &Url, query: &Message) -> Result<Message, ProbeError> {
        let body = codec::encode_datagram(query)?;
        let response = self
            .http
            .post(url.clone())
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(ProbeError::UpstreamStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        codec::decode_datagram(&bytes)
    }

    async fn query_https_json(
        &self,
        url: &Url,
        name: &str,
        record_type: RecordType,
    ) -> Result<Vec<DnsAnswer>, ProbeError> {
        let rtype = record_type.to_string();
        let response = self
            .http
            .get(url.clone())
            .query(&[("name", name), ("type", rtype.as_str())])
            .header(ACCEPT, DNS_JSON)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ProbeError::UpstreamStatus {
                status: status.as_u16(),
                body: text,
            });
        }

        let envelope: JsonEnvelope =
            serde_json::from_str(&text).map_err(|e| ProbeError::ProtocolMalformed {
                message: format!("invalid dns-json envelope: {e}"),
                body: Some(text.clone()),
            })?;

        Ok(envelope
            .answer
            .into_iter()
            .map(|a| {
                let rtype = RecordType::from(a.record_type);
                let raw = if rtype == RecordType::TXT {
                    RawPayload::Segments(codec::split_txt_presentation(&a.data))
                } else {
                    RawPayload::Text(a.data)
                };
                DnsAnswer {
                    name: a.name,
                    record_type: rtype,
                    ttl: a.ttl,
                    data: codec::normalize(rtype, raw),
                }
            })
            .collect())
    }

    async fn query_tls(&self, host: &str, port: u16, query: &Message) -> Result<Message, ProbeError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ProbeError::InvalidResolver(format!("tls://{host}:{port}")))?;

        let tcp = TcpStream::connect((host, port)).await?;
        let mut stream = self.tls.connect(server_name, tcp).await?;
        trace!(host, port, "TLS handshake complete");

        stream.write_all(&codec::encode_stream(query)?).await?;
        stream.flush().await?;

        let mut accumulator = StreamFrameAccumulator::new();
        let mut chunk = [0u8; 4096];
        let frame = loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ProbeError::malformed(format!(
                    "connection closed after {} of {:?} bytes",
                    accumulator.received(),
                    accumulator.expected()
                )));
            }
            if let Some(frame) = accumulator.push(&chunk[..n])? {
                break frame;
            }
        };

        let _ = stream.shutdown().await;
        codec::decode_datagram(&frame)
    }
}

fn check_response_id(query: &Message, response: &Message) -> Result<(), ProbeError> {
    if response.id() != query.id() {
        return Err(ProbeError::malformed(format!(
            "response id {} does not match query id {}",
            response.id(),
            query.id()
        )));
    }
    Ok(())
}

#[async_trait]
impl Resolve for DnsClient {
    async fn resolve(
        &self,
        endpoint: &ResolverEndpoint,
        name: &str,
        record_type: RecordType,
        cancel: CancelSignal,
    ) -> Result<Vec<DnsAnswer>, ProbeError> {
        if !codec::SUPPORTED_RECORD_TYPES.contains(&record_type) {
            return Err(ProbeError::InvalidRecordType(record_type.to_string()));
        }
        let timer = Timer::start();
        let transport = endpoint.transport();

        let work = async {
            match endpoint {
                ResolverEndpoint::HttpsJson(url) => {
                    self.query_https_json(url, name, record_type).await
                }
                ResolverEndpoint::Https(url) => {
                    let query = codec::build_query(name, record_type)?;
                    let response = self.query_https(url, &query).await?;
                    check_response_id(&query, &response)?;
                    Ok(codec::answers_from_message(&response))
                }
                ResolverEndpoint::Tls { host, port } => {
                    let query = codec::build_query(name, record_type)?;
                    let response = self.query_tls(host, *port, &query).await?;
                    check_response_id(&query, &response)?;
                    Ok(codec::answers_from_message(&response))
                }
            }
        };

        let result = with_cancellation(cancel, self.deadline, work).await;
        metrics::record_resolution(transport, &result, timer.elapsed());
        match &result {
            Ok(answers) => {
                debug!(%endpoint, name, rtype = %record_type, count = answers.len(), "resolved")
            }
            Err(e) => debug!(%endpoint, name, rtype = %record_type, error = %e, "resolution failed"),
        }
        result
    }
}
