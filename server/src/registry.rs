//! Client Registration Store
//!
//! SQLite storage for client registrations (identity → hostname → address).
//! Entries are immutable once written; there is no update or delete path.
//!
//! Hostname allocation and the insert that claims it run under the same
//! connection lock, so two concurrent registrations can never be handed the
//! same hostname. The `UNIQUE` constraint on `hostname` backs this up at the
//! schema level.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::names::{is_valid_label, NameGenerator};

/// Upper bound on candidates drawn for a single allocation
const MAX_ALLOCATION_ATTEMPTS: usize = 1024;

/// Registration store errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Client {0} is already registered")]
    DuplicateIdentity(Uuid),

    #[error("Hostname {0} is already taken")]
    HostnameTaken(String),

    #[error("Client {0} not found")]
    NotFound(Uuid),

    #[error("No free hostname found after {0} candidates")]
    HostnameSpaceExhausted(usize),

    #[error("Stored registration is corrupt: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// A persisted client registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub identity: Uuid,
    /// Short label, not qualified with the served domain
    pub hostname: String,
    pub ip: IpAddr,
}

impl Registration {
    /// Fully-qualified hostname under `domain`
    pub fn fqdn(&self, domain: &str) -> String {
        format!("{}.{}", self.hostname, domain)
    }
}

/// SQLite backed registration store
pub struct RegistrationStore {
    conn: Arc<Mutex<Connection>>,
    names: Arc<dyn NameGenerator>,
}

impl RegistrationStore {
    /// Open (or create) the store at `db_path`
    pub fn open<P: AsRef<Path>>(
        db_path: P,
        names: Arc<dyn NameGenerator>,
    ) -> Result<Self, RegistryError> {
        let conn = Connection::open(db_path)?;
        Self::create_tables(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            names,
        })
    }

    /// Create an in-memory store (useful for testing)
    pub fn in_memory(names: Arc<dyn NameGenerator>) -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        Self::create_tables(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            names,
        })
    }

    fn create_tables(conn: &Connection) -> Result<(), RegistryError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS clients (
                uuid TEXT PRIMARY KEY,
                hostname TEXT NOT NULL UNIQUE,
                ip TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// Draw candidates until one is not taken by any stored registration.
    ///
    /// On its own this does not reserve the name; use
    /// [`register_client`](Self::register_client) to allocate and claim in
    /// one step.
    pub async fn allocate_hostname(&self) -> Result<String, RegistryError> {
        let conn = self.conn.lock().await;
        self.allocate_locked(&conn)
    }

    fn allocate_locked(&self, conn: &Connection) -> Result<String, RegistryError> {
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let candidate = self.names.candidate();
            if !is_valid_label(&candidate) {
                debug!(candidate = %candidate, "Discarding invalid hostname candidate");
                continue;
            }

            let taken: i64 = conn.query_row(
                "SELECT COUNT(*) FROM clients WHERE hostname = ?1",
                params![candidate],
                |row| row.get(0),
            )?;

            if taken == 0 {
                debug!(hostname = %candidate, "Hostname is unique");
                return Ok(candidate);
            }
            debug!(hostname = %candidate, "Hostname already exists, drawing again");
        }

        Err(RegistryError::HostnameSpaceExhausted(MAX_ALLOCATION_ATTEMPTS))
    }

    /// Register `identity` at `ip` under a freshly allocated hostname.
    ///
    /// The duplicate check, the allocation and the insert form one critical
    /// section.
    pub async fn register_client(
        &self,
        identity: Uuid,
        ip: IpAddr,
    ) -> Result<Registration, RegistryError> {
        let conn = self.conn.lock().await;

        let existing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM clients WHERE uuid = ?1",
            params![identity.to_string()],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Err(RegistryError::DuplicateIdentity(identity));
        }

        let hostname = self.allocate_locked(&conn)?;
        self.insert_locked(&conn, identity, &hostname, ip)?;

        info!(client_id = %identity, hostname = %hostname, ip = %ip, "Client registered");
        Ok(Registration { identity, hostname, ip })
    }

    /// Register `identity` under a caller-chosen hostname.
    ///
    /// Used when the server is configured with a fixed name for itself, so
    /// no client can later be allocated the same label.
    pub async fn claim_hostname(
        &self,
        identity: Uuid,
        hostname: &str,
        ip: IpAddr,
    ) -> Result<Registration, RegistryError> {
        let conn = self.conn.lock().await;

        let taken: i64 = conn.query_row(
            "SELECT COUNT(*) FROM clients WHERE hostname = ?1",
            params![hostname],
            |row| row.get(0),
        )?;
        if taken > 0 {
            return Err(RegistryError::HostnameTaken(hostname.to_string()));
        }
        self.insert_locked(&conn, identity, hostname, ip)?;

        Ok(Registration {
            identity,
            hostname: hostname.to_string(),
            ip,
        })
    }

    fn insert_locked(
        &self,
        conn: &Connection,
        identity: Uuid,
        hostname: &str,
        ip: IpAddr,
    ) -> Result<(), RegistryError> {
        conn.execute(
            "INSERT INTO clients (uuid, hostname, ip) VALUES (?1, ?2, ?3)",
            params![identity.to_string(), hostname, ip.to_string()],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(ref err, ref message)
                if err.code == ErrorCode::ConstraintViolation =>
            {
                // "UNIQUE constraint failed: clients.hostname"
                if message.as_deref().is_some_and(|m| m.contains("clients.hostname")) {
                    RegistryError::HostnameTaken(hostname.to_string())
                } else {
                    RegistryError::DuplicateIdentity(identity)
                }
            }
            other => RegistryError::Database(other),
        })?;

        Ok(())
    }

    /// Load the registration for `identity`
    pub async fn lookup_client(&self, identity: Uuid) -> Result<Registration, RegistryError> {
        let conn = self.conn.lock().await;

        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT hostname, ip FROM clients WHERE uuid = ?1",
                params![identity.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (hostname, ip) = row.ok_or(RegistryError::NotFound(identity))?;
        let ip = ip
            .parse()
            .map_err(|_| RegistryError::Corrupt(format!("invalid address '{}' for {}", ip, identity)))?;

        Ok(Registration { identity, hostname, ip })
    }

    /// Find the registration that owns `hostname`, if any
    pub async fn find_by_hostname(
        &self,
        hostname: &str,
    ) -> Result<Option<Registration>, RegistryError> {
        let conn = self.conn.lock().await;

        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT uuid, ip FROM clients WHERE hostname = ?1",
                params![hostname],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(identity, ip)| {
            let identity = Uuid::parse_str(&identity)
                .map_err(|_| RegistryError::Corrupt(format!("invalid identity '{}'", identity)))?;
            let ip = ip
                .parse()
                .map_err(|_| RegistryError::Corrupt(format!("invalid address '{}'", ip)))?;
            Ok(Registration {
                identity,
                hostname: hostname.to_string(),
                ip,
            })
        })
        .transpose()
    }

    /// Number of hostnames handed out so far
    pub async fn hostname_count(&self) -> Result<u64, RegistryError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(DISTINCT hostname) FROM clients", [], |row| {
            row.get(0)
        })?;
        Ok(count as u64)
    }
}
