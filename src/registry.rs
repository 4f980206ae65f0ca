//! Fleet registry: which probe actors exist and where each one is locked.
//!
//! The registry is the single source of truth for fleet membership. It also
//! stores the resolver endpoints each location queries.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::ProbeError;
use crate::location::{FineLocationCode, Location};
use crate::resolver::ResolverEndpoint;
use crate::substrate::ProbeId;

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS locations (
    location TEXT PRIMARY KEY NOT NULL,
    doh TEXT NOT NULL DEFAULT '[]',
    dot TEXT NOT NULL DEFAULT '[]'
);
CREATE UNIQUE INDEX IF NOT EXISTS locations_location_nocase
    ON locations (location COLLATE NOCASE);

CREATE TABLE IF NOT EXISTS instances (
    do_id BLOB PRIMARY KEY NOT NULL,
    location TEXT NOT NULL
        REFERENCES locations (location) ON UPDATE CASCADE ON DELETE CASCADE,
    iata TEXT NOT NULL UNIQUE,
    iso_country TEXT NOT NULL,
    iso_region TEXT
);

CREATE TABLE IF NOT EXISTS global_servers (
    id INTEGER PRIMARY KEY,
    doh TEXT UNIQUE,
    dot TEXT UNIQUE,
    CHECK (doh IS NOT NULL OR dot IS NOT NULL)
);
"#;

/// One registered probe actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRow {
    /// Actor identity.
    pub id: ProbeId,
    /// Coarse location the actor was created for.
    pub location: Location,
    /// Verified fine location code.
    pub code: FineLocationCode,
    /// ISO country of the site.
    pub country: String,
    /// ISO subdivision of the site.
    pub subdivision: Option<String>,
}

/// Durable fleet record.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Insert every [`Location`] that is not present yet.
    async fn ensure_locations(&self) -> Result<(), ProbeError>;

    /// Every registered actor.
    async fn list_instances(&self) -> Result<Vec<RegistryRow>, ProbeError>;

    /// The row for `id`, if registered.
    async fn find_instance(&self, id: ProbeId) -> Result<Option<RegistryRow>, ProbeError>;

    /// Register a verified actor.
    async fn insert_instance(&self, row: RegistryRow) -> Result<(), ProbeError>;

    /// Remove the row for `id`. Returns whether a row was removed.
    async fn delete_instance(&self, id: ProbeId) -> Result<bool, ProbeError>;

    /// Replace the resolver endpoints of one location.
    async fn set_location_resolvers(
        &self,
        location: Location,
        endpoints: Vec<ResolverEndpoint>,
    ) -> Result<(), ProbeError>;

    /// Add an endpoint used by every location. Existing entries are kept.
    async fn add_global_resolver(&self, endpoint: ResolverEndpoint) -> Result<(), ProbeError>;

    /// Endpoints for `location` followed by the global list, without duplicates.
    async fn resolvers_for(&self, location: Location) -> Result<Vec<ResolverEndpoint>, ProbeError>;
}

/// SQLite-backed [`Registry`].
#[derive(Clone)]
pub struct SqliteRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRegistry {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ProbeError> {
        let conn = Connection::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "opened fleet registry");
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self, ProbeError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, ProbeError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, ProbeError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, ProbeError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await?
    }
}

type RawRow = (Vec<u8>, String, String, String, Option<String>);

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn convert_row((id, location, code, country, subdivision): RawRow) -> Result<RegistryRow, ProbeError> {
    Ok(RegistryRow {
        id: ProbeId::from_slice(&id)?,
        location: location.parse()?,
        code: FineLocationCode::new(&code)?,
        country,
        subdivision,
    })
}

fn parse_endpoint_list(json: &str, out: &mut Vec<ResolverEndpoint>) -> Result<(), ProbeError> {
    let raw: Vec<String> = serde_json::from_str(json)?;
    for entry in raw {
        push_unique(out, entry.parse()?);
    }
    Ok(())
}

fn push_unique(out: &mut Vec<ResolverEndpoint>, endpoint: ResolverEndpoint) {
    if !out.contains(&endpoint) {
        out.push(endpoint);
    }
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn ensure_locations(&self) -> Result<(), ProbeError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("INSERT OR IGNORE INTO locations (location) VALUES (?1)")?;
            let mut inserted = 0;
            for location in Location::ALL {
                inserted += stmt.execute(params![location.as_str()])?;
            }
            if inserted > 0 {
                debug!(inserted, "seeded locations");
            }
            Ok(())
        })
        .await
    }

    async fn list_instances(&self) -> Result<Vec<RegistryRow>, ProbeError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT do_id, location, iata, iso_country, iso_region FROM instances ORDER BY iata",
            )?;
            let raw = stmt
                .query_map([], read_raw)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raw.into_iter().map(convert_row).collect()
        })
        .await
    }

    async fn find_instance(&self, id: ProbeId) -> Result<Option<RegistryRow>, ProbeError> {
        self.blocking(move |conn| {
            let raw = conn
                .query_row(
                    "SELECT do_id, location, iata, iso_country, iso_region FROM instances WHERE do_id = ?1",
                    params![id.as_bytes().as_slice()],
                    read_raw,
                )
                .optional()?;
            raw.map(convert_row).transpose()
        })
        .await
    }

    async fn insert_instance(&self, row: RegistryRow) -> Result<(), ProbeError> {
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO instances (do_id, location, iata, iso_country, iso_region) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.id.as_bytes().as_slice(),
                    row.location.as_str(),
                    row.code.as_str(),
                    row.country,
                    row.subdivision,
                ],
            )?;
            debug!(id = %row.id, code = %row.code, location = %row.location, "registered instance");
            Ok(())
        })
        .await
    }

    async fn delete_instance(&self, id: ProbeId) -> Result<bool, ProbeError> {
        self.blocking(move |conn| {
            let removed = conn.execute(
                "DELETE FROM instances WHERE do_id = ?1",
                params![id.as_bytes().as_slice()],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn set_location_resolvers(
        &self,
        location: Location,
        endpoints: Vec<ResolverEndpoint>,
    ) -> Result<(), ProbeError> {
        let (dot, doh): (Vec<_>, Vec<_>) = endpoints
            .iter()
            .partition(|e| matches!(e, ResolverEndpoint::Tls { .. }));
        let doh = serde_json::to_string(&doh.iter().map(ToString::to_string).collect::<Vec<_>>())?;
        let dot = serde_json::to_string(&dot.iter().map(ToString::to_string).collect::<Vec<_>>())?;

        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO locations (location, doh, dot) VALUES (?1, ?2, ?3)
                 ON CONFLICT (location) DO UPDATE SET doh = excluded.doh, dot = excluded.dot",
                params![location.as_str(), doh, dot],
            )?;
            Ok(())
        })
        .await
    }

    async fn add_global_resolver(&self, endpoint: ResolverEndpoint) -> Result<(), ProbeError> {
        let text = endpoint.to_string();
        let is_dot = matches!(endpoint, ResolverEndpoint::Tls { .. });
        self.blocking(move |conn| {
            let sql = if is_dot {
                "INSERT OR IGNORE INTO global_servers (dot) VALUES (?1)"
            } else {
                "INSERT OR IGNORE INTO global_servers (doh) VALUES (?1)"
            };
            conn.execute(sql, params![text])?;
            Ok(())
        })
        .await
    }

    async fn resolvers_for(&self, location: Location) -> Result<Vec<ResolverEndpoint>, ProbeError> {
        self.blocking(move |conn| {
            let mut endpoints = Vec::new();

            let lists: Option<(String, String)> = conn
                .query_row(
                    "SELECT doh, dot FROM locations WHERE location = ?1",
                    params![location.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((doh, dot)) = lists {
                parse_endpoint_list(&doh, &mut endpoints)?;
                parse_endpoint_list(&dot, &mut endpoints)?;
            }

            let mut stmt = conn.prepare("SELECT doh, dot FROM global_servers ORDER BY id")?;
            let globals = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (doh, dot) in globals {
                for entry in doh.into_iter().chain(dot) {
                    push_unique(&mut endpoints, entry.parse()?);
                }
            }

            Ok(endpoints)
        })
        .await
    }
}
