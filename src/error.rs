//! Error types for probe-dns.

use thiserror::Error;

use crate::location::FineLocationCode;

/// Errors produced by the controller, the probe actors, and the resolver client.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The desired-location feed could not be fetched; the whole cycle is abandoned.
    #[error("discovery feed unavailable: {0}")]
    DiscoveryUnavailable(String),

    /// A freshly created actor verified at a different vantage point than requested.
    #[error("placement mismatch: wanted {expected}, actor landed in {actual}")]
    PlacementMismatch {
        /// Code the controller was trying to fill.
        expected: FineLocationCode,
        /// Code the candidate actually reported.
        actual: FineLocationCode,
    },

    /// Every attempt allowed for a location was used without a match.
    #[error("placement budget exhausted for {code} after {attempts} attempts")]
    PlacementBudgetExhausted {
        /// Code that could not be filled.
        code: FineLocationCode,
        /// Attempts made (equal to the budget).
        attempts: u32,
    },

    /// The registry row for a verified actor could not be written.
    #[error("registry write failed for {code}: {reason}")]
    RegistryWriteFailed {
        /// Code of the actor that was evicted as a result.
        code: FineLocationCode,
        /// Underlying failure.
        reason: String,
    },

    /// Upstream sent something that is not a usable response.
    #[error("malformed response: {message}")]
    ProtocolMalformed {
        /// Human-readable description.
        message: String,
        /// Raw upstream body, when one was received.
        body: Option<String>,
    },

    /// Upstream answered with a non-success HTTP status.
    #[error("upstream returned HTTP {status}")]
    UpstreamStatus {
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: String,
    },

    /// The caller cancelled the operation or its deadline passed.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Resolution requested before the actor was locked to a location.
    #[error("actor is not locked to a location")]
    NotLocked,

    /// `lock` was called with a code different from the one already stored.
    #[error("actor already locked to {existing}, refusing {requested}")]
    AlreadyLocked {
        /// Stored Locked State.
        existing: FineLocationCode,
        /// Code passed to the rejected call.
        requested: FineLocationCode,
    },

    /// The actor has evicted itself and accepts no further work.
    #[error("actor has been evicted")]
    Evicted,

    /// The site directory has no entry for a code.
    #[error("no site directory entry for {0}")]
    UnknownSite(FineLocationCode),

    /// The region-mapping service returned no location.
    #[error("no location matches country {country} (subdivision {subdivision:?})")]
    RegionUnmapped {
        /// ISO country code.
        country: String,
        /// ISO subdivision code.
        subdivision: Option<String>,
    },

    /// Resolver reference could not be parsed.
    #[error("invalid resolver endpoint: {0}")]
    InvalidResolver(String),

    /// Record type not served by the probes.
    #[error("unsupported record type: {0}")]
    InvalidRecordType(String),

    /// Unknown coarse location name.
    #[error("invalid location: {0}")]
    InvalidLocation(String),

    /// Fine location code failed validation.
    #[error("invalid location code: {0:?}")]
    InvalidCode(String),

    /// Probe identity failed to parse.
    #[error("invalid probe id: {0}")]
    InvalidId(String),

    /// Registry storage error.
    #[error("registry error: {0}")]
    Registry(#[from] rusqlite::Error),

    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A blocking or background task failed to complete.
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ProbeError {
    /// Build a [`ProbeError::ProtocolMalformed`] without an upstream body.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::ProtocolMalformed {
            message: message.into(),
            body: None,
        }
    }

    /// True for errors caused by cancellation or deadline expiry.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Raw upstream body attached to the error, if any.
    pub fn upstream_body(&self) -> Option<&str> {
        match self {
            Self::ProtocolMalformed { body, .. } => body.as_deref(),
            Self::UpstreamStatus { body, .. } => Some(body),
            _ => None,
        }
    }
}
