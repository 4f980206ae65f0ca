//! Host substrate abstractions.
//!
//! The actor host provides, per actor: durable key-value storage, one
//! wall-clock alarm slot, and a self-destruct primitive. Fleet-wide it
//! provides a namespace that allocates identities and instantiates actors
//! with a coarse location hint. Calls into an actor go through the typed
//! [`ProbeHandle`] surface.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hickory_proto::rr::RecordType;
use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::actor::FanOutResults;
use crate::codec::DnsAnswer;
use crate::error::ProbeError;
use crate::location::{FineLocationCode, Location};
use crate::resolver::{CancelSignal, ResolverEndpoint};

/// Size of a probe identity in bytes.
pub const PROBE_ID_LEN: usize = 32;

/// Opaque, globally unique actor identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId([u8; PROBE_ID_LEN]);

impl ProbeId {
    /// Draw a fresh random identity.
    pub fn random() -> Self {
        let mut bytes = [0u8; PROBE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw bytes, as stored in the registry.
    pub fn as_bytes(&self) -> &[u8; PROBE_ID_LEN] {
        &self.0
    }

    /// Rebuild from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProbeError> {
        let array: [u8; PROBE_ID_LEN] = bytes
            .try_into()
            .map_err(|_| ProbeError::InvalidId(format!("expected {PROBE_ID_LEN} bytes, got {}", bytes.len())))?;
        Ok(Self(array))
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProbeId({self})")
    }
}

impl FromStr for ProbeId {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| ProbeError::InvalidId(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

/// Where an actor is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    /// Created, no Locked State yet.
    Unlocked,
    /// Committed to a fine location code.
    Locked(FineLocationCode),
    /// Terminal: storage cleared, destruction scheduled.
    Evicted,
}

/// Per-actor services supplied by the host.
#[async_trait]
pub trait ActorHost: Send + Sync {
    /// Read a durable value.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, ProbeError>;

    /// Write a durable value.
    async fn put(&self, key: &str, value: Bytes) -> Result<(), ProbeError>;

    /// Erase all durable values.
    async fn delete_all(&self) -> Result<(), ProbeError>;

    /// Currently armed alarm, if any.
    async fn alarm(&self) -> Result<Option<DateTime<Utc>>, ProbeError>;

    /// Arm (or move) the alarm.
    async fn set_alarm(&self, at: DateTime<Utc>) -> Result<(), ProbeError>;

    /// Disarm the alarm.
    async fn delete_alarm(&self) -> Result<(), ProbeError>;

    /// Irrevocably destroy the actor. Must not be called from inside a handler.
    async fn self_destruct(&self);
}

/// Typed call surface of one probe actor.
#[async_trait]
pub trait ProbeHandle: Send + Sync {
    /// Identity of the actor behind this handle.
    fn id(&self) -> ProbeId;

    /// Live fine location code of the actor.
    async fn verify_location(&self) -> Result<FineLocationCode, ProbeError>;

    /// Commit the actor to `code`.
    async fn lock(&self, code: FineLocationCode) -> Result<(), ProbeError>;

    /// Evict the actor. Idempotent.
    async fn evict(&self) -> Result<(), ProbeError>;

    /// Resolve through the actor.
    async fn resolve(
        &self,
        endpoint: ResolverEndpoint,
        name: String,
        record_type: RecordType,
        use_cache: bool,
        cancel: CancelSignal,
    ) -> Result<Vec<DnsAnswer>, ProbeError>;

    /// Resolve `name` against every resolver configured for the actor's
    /// location plus the global ones, in that order.
    async fn resolve_all(
        &self,
        name: String,
        record_type: RecordType,
        use_cache: bool,
        cancel: CancelSignal,
    ) -> Result<FanOutResults, ProbeError>;
}

/// Fleet-wide actor allocation.
#[async_trait]
pub trait ActorNamespace: Send + Sync {
    /// Allocate an identity for a new actor.
    fn new_unique_id(&self) -> ProbeId;

    /// Instantiate `id`, hinting placement toward `hint`.
    async fn create(&self, id: ProbeId, hint: Location) -> Result<Arc<dyn ProbeHandle>, ProbeError>;

    /// Handle to an existing actor (instantiated empty if unknown).
    async fn get(&self, id: ProbeId) -> Result<Arc<dyn ProbeHandle>, ProbeError>;
}
