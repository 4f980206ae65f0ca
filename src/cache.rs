//! Location-partitioned cache of resolver responses.
//!
//! Entries are keyed by the owning actor's Locked State plus the
//! (resolver, name, type) tuple, so two actors never observe each other's
//! entries even when they share one store. Freshness is the minimum TTL of
//! the answers and is enforced by the store's per-entry expiry.

use chrono::{DateTime, Utc};
use hickory_proto::rr::RecordType;
use moka::future::Cache;
use moka::Expiry;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::codec::DnsAnswer;
use crate::error::ProbeError;
use crate::location::FineLocationCode;
use crate::metrics;
use crate::resolver::ResolverEndpoint;

/// Cache key. The partition is the actor's Locked State.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    partition: FineLocationCode,
    resolver: String,
    name: String,
    record_type: RecordType,
}

impl CacheKey {
    /// Build a key; the name is compared case-insensitively and without a trailing dot.
    pub fn new(
        partition: &FineLocationCode,
        resolver: &ResolverEndpoint,
        name: &str,
        record_type: RecordType,
    ) -> Self {
        Self {
            partition: partition.clone(),
            resolver: resolver.to_string(),
            name: name.trim_end_matches('.').to_ascii_lowercase(),
            record_type,
        }
    }
}

/// A stored resolution.
#[derive(Debug, Clone)]
pub struct CachedResolution {
    /// Normalized answers as returned by the resolver.
    pub answers: Vec<DnsAnswer>,
    /// Freshness lifetime (minimum answer TTL).
    pub valid_for: Duration,
    /// When the entry was written.
    pub stored_at: DateTime<Utc>,
    /// Content fingerprint usable as a conditional-request token.
    pub etag: String,
}

struct FreshnessExpiry;

impl Expiry<CacheKey, Arc<CachedResolution>> for FreshnessExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &Arc<CachedResolution>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.valid_for)
    }
}

/// Minimum TTL across answers; zero when there are none.
pub fn min_ttl(answers: &[DnsAnswer]) -> Duration {
    answers
        .iter()
        .map(|a| a.ttl)
        .min()
        .map(|ttl| Duration::from_secs(u64::from(ttl)))
        .unwrap_or(Duration::ZERO)
}

/// Hex SHA-256 of the serialized answers, quoted as an HTTP entity tag.
pub fn fingerprint(answers: &[DnsAnswer]) -> Result<String, ProbeError> {
    let serialized = serde_json::to_vec(answers)?;
    let digest = Sha256::digest(&serialized);
    Ok(format!("\"{}\"", hex::encode(digest)))
}

/// Shared, partitioned response cache.
#[derive(Clone)]
pub struct ResponseCache {
    inner: Cache<CacheKey, Arc<CachedResolution>>,
}

impl ResponseCache {
    /// Create a cache bounded to `max_entries`.
    pub fn new(max_entries: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_entries)
                .expire_after(FreshnessExpiry)
                .build(),
        }
    }

    /// Look up a fresh entry.
    pub async fn get(&self, key: &CacheKey) -> Option<Arc<CachedResolution>> {
        let hit = self.inner.get(key).await;
        metrics::record_cache_lookup(hit.is_some());
        trace!(partition = %key.partition, name = %key.name, hit = hit.is_some(), "cache lookup");
        hit
    }

    /// Store answers under `key`. Answers with zero lifetime are not stored.
    pub async fn store(
        &self,
        key: CacheKey,
        answers: Vec<DnsAnswer>,
    ) -> Result<Option<Arc<CachedResolution>>, ProbeError> {
        let valid_for = min_ttl(&answers);
        if valid_for.is_zero() {
            trace!(partition = %key.partition, name = %key.name, "zero TTL, not caching");
            return Ok(None);
        }

        let entry = Arc::new(CachedResolution {
            etag: fingerprint(&answers)?,
            answers,
            valid_for,
            stored_at: Utc::now(),
        });
        self.inner.insert(key, entry.clone()).await;
        metrics::record_cache_store();
        Ok(Some(entry))
    }
}
