//! External feeds: desired locations, region mapping, and the site directory.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{RegionsConfig, ResolverConfig};
use crate::error::ProbeError;
use crate::location::{FineLocationCode, Location, SiteInfo};

/// Source of the Desired Location Set.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Fetch the current list of live fine location codes.
    async fn desired_locations(&self) -> Result<Vec<FineLocationCode>, ProbeError>;
}

/// Maps a site's country and subdivision to a coarse [`Location`].
#[async_trait]
pub trait RegionMapper: Send + Sync {
    /// `None` when no location matches.
    async fn map(
        &self,
        country: &str,
        subdivision: Option<&str>,
    ) -> Result<Option<Location>, ProbeError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedEntry {
    Site { iata: String },
    Code(String),
}

/// Parse a discovery feed body.
///
/// Entries that are not valid codes are skipped with a warning; duplicates
/// collapse to one.
pub fn parse_feed(body: &str) -> Result<Vec<FineLocationCode>, ProbeError> {
    let entries: Vec<FeedEntry> = serde_json::from_str(body)
        .map_err(|e| ProbeError::DiscoveryUnavailable(format!("unparseable feed: {e}")))?;

    let mut codes: Vec<FineLocationCode> = Vec::with_capacity(entries.len());
    for entry in entries {
        let raw = match entry {
            FeedEntry::Site { iata } => iata,
            FeedEntry::Code(code) => code,
        };
        match FineLocationCode::new(&raw) {
            Ok(code) if !codes.contains(&code) => codes.push(code),
            Ok(_) => {}
            Err(e) => warn!(entry = %raw, error = %e, "skipping feed entry"),
        }
    }
    Ok(codes)
}

/// HTTP discovery feed.
pub struct HttpDiscovery {
    client: reqwest::Client,
    url: String,
}

impl HttpDiscovery {
    /// Build a feed client for `url`.
    pub fn new(url: impl Into<String>, resolver: &ResolverConfig) -> Result<Self, ProbeError> {
        Ok(Self {
            client: http_client(resolver)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Discovery for HttpDiscovery {
    async fn desired_locations(&self) -> Result<Vec<FineLocationCode>, ProbeError> {
        let unavailable = |e: reqwest::Error| ProbeError::DiscoveryUnavailable(e.to_string());

        let response = self.client.get(&self.url).send().await.map_err(unavailable)?;
        let status = response.status();
        let body = response.text().await.map_err(unavailable)?;
        if !status.is_success() {
            return Err(ProbeError::DiscoveryUnavailable(format!(
                "{} returned HTTP {}",
                self.url,
                status.as_u16()
            )));
        }

        let codes = parse_feed(&body)?;
        debug!(count = codes.len(), url = %self.url, "fetched desired locations");
        Ok(codes)
    }
}

#[derive(Debug, Deserialize)]
struct MappingResponse {
    location: Option<Location>,
}

/// Region mapper backed by an HTTP service.
pub struct HttpRegionMapper {
    client: reqwest::Client,
    url: String,
}

impl HttpRegionMapper {
    /// Build a mapper querying `url`.
    pub fn new(url: impl Into<String>, resolver: &ResolverConfig) -> Result<Self, ProbeError> {
        Ok(Self {
            client: http_client(resolver)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RegionMapper for HttpRegionMapper {
    async fn map(
        &self,
        country: &str,
        subdivision: Option<&str>,
    ) -> Result<Option<Location>, ProbeError> {
        let mut query = vec![("country", country)];
        if let Some(subdivision) = subdivision {
            query.push(("subdivision", subdivision));
        }

        let response = self.client.get(&self.url).query(&query).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ProbeError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: MappingResponse =
            serde_json::from_str(&body).map_err(|e| ProbeError::ProtocolMalformed {
                message: format!("region mapping: {e}"),
                body: Some(body.clone()),
            })?;
        Ok(parsed.location)
    }
}

/// Region mapper over static tables. Subdivisions are checked first.
#[derive(Debug, Clone, Default)]
pub struct TableRegionMapper {
    countries: HashMap<String, Location>,
    subdivisions: HashMap<String, Location>,
}

impl TableRegionMapper {
    /// Build from configuration. Keys are matched case-insensitively.
    pub fn from_config(config: &RegionsConfig) -> Self {
        let upper = |table: &HashMap<String, Location>| -> HashMap<String, Location> {
            table
                .iter()
                .map(|(k, v)| (k.to_ascii_uppercase(), *v))
                .collect()
        };
        Self {
            countries: upper(&config.countries),
            subdivisions: upper(&config.subdivisions),
        }
    }
}

#[async_trait]
impl RegionMapper for TableRegionMapper {
    async fn map(
        &self,
        country: &str,
        subdivision: Option<&str>,
    ) -> Result<Option<Location>, ProbeError> {
        let by_subdivision = subdivision
            .and_then(|s| self.subdivisions.get(&s.to_ascii_uppercase()))
            .copied();
        Ok(by_subdivision.or_else(|| self.countries.get(&country.to_ascii_uppercase()).copied()))
    }
}

/// Fine location code to country/subdivision lookup.
#[derive(Debug, Clone, Default)]
pub struct SiteDirectory {
    sites: HashMap<FineLocationCode, SiteInfo>,
}

impl SiteDirectory {
    /// Build from the configured `sites` table. Invalid codes are skipped.
    pub fn from_config(sites: &HashMap<String, SiteInfo>) -> Self {
        let mut directory = Self::default();
        for (raw, info) in sites {
            match FineLocationCode::new(raw) {
                Ok(code) => directory.insert(code, info.clone()),
                Err(e) => warn!(code = %raw, error = %e, "skipping site directory entry"),
            }
        }
        directory
    }

    /// Add or replace one site.
    pub fn insert(&mut self, code: FineLocationCode, info: SiteInfo) {
        self.sites.insert(code, info);
    }

    /// Site details for `code`.
    pub fn lookup(&self, code: &FineLocationCode) -> Result<&SiteInfo, ProbeError> {
        self.sites
            .get(code)
            .ok_or_else(|| ProbeError::UnknownSite(code.clone()))
    }

    /// Number of known sites.
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// True when no sites are known.
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

fn http_client(resolver: &ResolverConfig) -> Result<reqwest::Client, ProbeError> {
    Ok(reqwest::Client::builder()
        .user_agent(&resolver.user_agent)
        .timeout(Duration::from_millis(resolver.timeout_ms))
        .build()?)
}
