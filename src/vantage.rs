//! Self-vantage checks: which point-of-presence is this process answering from.

use async_trait::async_trait;
use moka::future::Cache;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::config::{ProbeConfig, ResolverConfig};
use crate::error::ProbeError;
use crate::location::FineLocationCode;

/// Reports the live fine location code of the caller.
#[async_trait]
pub trait VantageProbe: Send + Sync {
    /// Fetch the current vantage point.
    async fn own_location(&self) -> Result<FineLocationCode, ProbeError>;
}

/// Parse a `key=value` trace blob.
///
/// Blank lines are skipped. Any other line without `=` makes the whole blob
/// malformed. Later duplicates win.
pub fn parse_trace(text: &str) -> Result<HashMap<String, String>, ProbeError> {
    let mut fields = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ProbeError::ProtocolMalformed {
                message: format!("trace line without '=': {line:?}"),
                body: Some(text.to_string()),
            });
        };
        fields.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(fields)
}

/// Vantage probe backed by an HTTP trace endpoint.
pub struct TraceVantage {
    client: reqwest::Client,
    url: String,
    field: String,
    memo: Cache<(), FineLocationCode>,
}

impl TraceVantage {
    /// Build from configuration.
    pub fn new(probe: &ProbeConfig, resolver: &ResolverConfig) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .user_agent(&resolver.user_agent)
            .timeout(Duration::from_millis(resolver.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: probe.trace_url.clone(),
            field: probe.trace_field.clone(),
            memo: Cache::builder()
                .max_capacity(1)
                .time_to_live(Duration::from_secs(probe.trace_memo_secs.max(1)))
                .build(),
        })
    }

    async fn fetch(&self) -> Result<FineLocationCode, ProbeError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ProbeError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        let fields = parse_trace(&body)?;
        let raw = fields.get(&self.field).ok_or_else(|| ProbeError::ProtocolMalformed {
            message: format!("trace has no {:?} field", self.field),
            body: Some(body.clone()),
        })?;
        let code = FineLocationCode::new(raw)?;
        debug!(%code, url = %self.url, "fetched vantage trace");
        Ok(code)
    }
}

#[async_trait]
impl VantageProbe for TraceVantage {
    async fn own_location(&self) -> Result<FineLocationCode, ProbeError> {
        if let Some(code) = self.memo.get(&()).await {
            return Ok(code);
        }
        let code = self.fetch().await?;
        self.memo.insert((), code.clone()).await;
        Ok(code)
    }
}
