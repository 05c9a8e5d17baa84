//! Durable relational store (§4.9, §6.2 `<dbPath>`).
//!
//! One `rusqlite` connection behind a `Mutex`, the way the pack's own
//! server-shaped example wires sqlite: SQLite serializes writers internally,
//! and this workspace's convention (set by `protoreg-retry`'s stdlib-only
//! sync primitives) is to reach for a pool crate only when a single mutex
//! demonstrably bottlenecks, which a manifest registry's write volume does
//! not.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use protoreg_types::Manifest;
use rusqlite::{params, Connection, OptionalExtension};

const SCHEMA_VERSION: i64 = 1;

pub struct ManifestRecord {
    pub manifest: Manifest,
    pub digest: String,
    pub issuer: Option<String>,
    pub signature: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct HealthSnapshot {
    pub driver: &'static str,
    pub wal: bool,
    pub schema_version: i64,
    pub records: i64,
}

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS manifests (
                urn TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                digest TEXT NOT NULL,
                issuer TEXT,
                signature TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS capabilities (
                urn TEXT NOT NULL,
                cap TEXT NOT NULL,
                PRIMARY KEY (urn, cap)
            );
            CREATE TABLE IF NOT EXISTS provenance (
                urn TEXT NOT NULL,
                envelope TEXT NOT NULL,
                payload_type TEXT NOT NULL,
                digest TEXT NOT NULL,
                issuer TEXT,
                committed_at TEXT,
                PRIMARY KEY (urn, digest)
            );
            CREATE TABLE IF NOT EXISTS schema_history (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_history (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, Utc::now().to_rfc3339()],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert-or-replace by URN; `manifests.updated_at` is always refreshed.
    pub fn upsert_manifest(
        &self,
        manifest: &Manifest,
        digest: &str,
        issuer: Option<&str>,
        signature: Option<&serde_json::Value>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        let now = Utc::now().to_rfc3339();
        let body = serde_json::to_string(manifest)?;
        let signature_json = signature.map(serde_json::to_string).transpose()?;
        let existing_created_at: Option<String> = conn
            .query_row(
                "SELECT created_at FROM manifests WHERE urn = ?1",
                params![manifest.urn.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let created_at = existing_created_at.unwrap_or_else(|| now.clone());
        conn.execute(
            "INSERT INTO manifests (urn, body, digest, issuer, signature, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(urn) DO UPDATE SET
                body = excluded.body,
                digest = excluded.digest,
                issuer = excluded.issuer,
                signature = excluded.signature,
                updated_at = excluded.updated_at",
            params![
                manifest.urn.as_str(),
                body,
                digest,
                issuer,
                signature_json,
                created_at,
                now,
            ],
        )?;

        conn.execute(
            "DELETE FROM capabilities WHERE urn = ?1",
            params![manifest.urn.as_str()],
        )?;
        for cap in crate::provenance::extract_capabilities(manifest) {
            conn.execute(
                "INSERT OR IGNORE INTO capabilities (urn, cap) VALUES (?1, ?2)",
                params![manifest.urn.as_str(), cap],
            )?;
        }
        Ok(())
    }

    pub fn get_manifest(&self, urn: &str) -> anyhow::Result<Option<ManifestRecord>> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        let row = conn
            .query_row(
                "SELECT body, digest, issuer, signature, created_at, updated_at
                 FROM manifests WHERE urn = ?1",
                params![urn],
                |row| {
                    let body: String = row.get(0)?;
                    let digest: String = row.get(1)?;
                    let issuer: Option<String> = row.get(2)?;
                    let signature: Option<String> = row.get(3)?;
                    let created_at: String = row.get(4)?;
                    let updated_at: String = row.get(5)?;
                    Ok((body, digest, issuer, signature, created_at, updated_at))
                },
            )
            .optional()?;

        let Some((body, digest, issuer, signature, created_at, updated_at)) = row else {
            return Ok(None);
        };
        let manifest: Manifest = serde_json::from_str(&body)?;
        let signature = signature
            .map(|s| serde_json::from_str(&s))
            .transpose()?;
        Ok(Some(ManifestRecord {
            manifest,
            digest,
            issuer,
            signature,
            created_at,
            updated_at,
        }))
    }

    pub fn insert_provenance(
        &self,
        urn: &str,
        envelope: &serde_json::Value,
        payload_type: &str,
        digest: &str,
        issuer: Option<&str>,
        committed_at: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO provenance
                (urn, envelope, payload_type, digest, issuer, committed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                urn,
                serde_json::to_string(envelope)?,
                payload_type,
                digest,
                issuer,
                committed_at,
            ],
        )?;
        Ok(())
    }

    /// Most recently committed DSSE envelope for a URN, if any.
    pub fn get_provenance(&self, urn: &str) -> anyhow::Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        let envelope: Option<String> = conn
            .query_row(
                "SELECT envelope FROM provenance WHERE urn = ?1
                 ORDER BY committed_at DESC, digest DESC LIMIT 1",
                params![urn],
                |row| row.get(0),
            )
            .optional()?;
        Ok(envelope.map(|e| serde_json::from_str(&e)).transpose()?)
    }

    pub fn find_by_capability(&self, cap: &str) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        let mut stmt = conn.prepare("SELECT urn FROM capabilities WHERE cap = ?1 ORDER BY urn")?;
        let urns = stmt
            .query_map(params![cap], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(urns)
    }

    pub fn health(&self) -> anyhow::Result<HealthSnapshot> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        let records: i64 =
            conn.query_row("SELECT COUNT(*) FROM manifests", [], |row| row.get(0))?;
        let schema_version: i64 = conn
            .query_row(
                "SELECT MAX(version) FROM schema_history",
                [],
                |row| row.get(0),
            )
            .unwrap_or(SCHEMA_VERSION);
        let journal_mode: String =
            conn.pragma_query_value(None, "journal_mode", |row| row.get(0))?;
        Ok(HealthSnapshot {
            driver: "sqlite",
            wal: journal_mode.eq_ignore_ascii_case("wal"),
            schema_version,
            records,
        })
    }
}
