//! SQLite registry for services, deployments, settings, metrics and audit
//!
//! All cross-component mutable state lives here. The store is a single
//! connection behind a mutex, so every statement is serialized; callers that
//! need read-then-write consistency (port allocation, name uniqueness) rely
//! on re-reading at write time and on the schema's UNIQUE constraints.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::plan::BuildOverrides;

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Implements text round-tripping (serde, Display, FromStr, SQLite) for a
/// plain enum from a single variant/string table.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("invalid {}: {}", stringify!($name), other)),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Created,
    Building,
    Running,
    Stopped,
    Error,
    Archived,
}

text_enum!(ServiceStatus {
    Created => "created",
    Building => "building",
    Running => "running",
    Stopped => "stopped",
    Error => "error",
    Archived => "archived",
});

/// Outcome of a single deploy attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Success,
    Failed,
}

text_enum!(DeploymentStatus {
    Pending => "pending",
    Building => "building",
    Success => "success",
    Failed => "failed",
});

/// Built application or generic VM container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    App,
    Vm,
}

text_enum!(ServiceKind {
    App => "app",
    Vm => "vm",
});

/// Where a service's source comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Git,
    Upload,
    Image,
}

text_enum!(SourceType {
    Git => "git",
    Upload => "upload",
    Image => "image",
});

/// CPU fraction and memory bytes applied to a container
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub cpu: f64,
    pub memory: i64,
}

impl ResourceLimits {
    /// Scale both limits, used for build-time resources
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            cpu: self.cpu * factor,
            memory: (self.memory as f64 * factor) as i64,
        }
    }

    /// Named preset, if known
    pub fn preset(name: &str) -> Option<Self> {
        let (cpu, memory) = match name {
            "nano" => (0.1, 134_217_728),
            "micro" => (0.25, 268_435_456),
            "small" => (0.5, 536_870_912),
            "medium" => (1.0, 1_073_741_824),
            "large" => (2.0, 2_147_483_648),
            _ => return None,
        };
        Some(Self { cpu, memory })
    }
}

/// A deployable unit: built app or VM container
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub id: String,
    pub kind: ServiceKind,
    pub name: String,
    pub status: ServiceStatus,
    pub source_type: SourceType,
    pub source_url: Option<String>,
    pub branch: String,
    pub root_directory: String,
    pub container_id: Option<String>,
    pub image_ref: Option<String>,
    pub port: Option<u16>,
    pub internal_port: u16,
    pub limits: ResourceLimits,
    pub resource_preset: String,
    pub restart_policy: String,
    pub env_vars: HashMap<String, String>,
    pub overrides: BuildOverrides,
    pub framework: Option<String>,
    pub startup_script: Option<String>,
    pub last_deployed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Result of inserting a service record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    NameTaken,
    PortTaken,
}

impl ServiceRecord {
    /// A fresh app record with platform defaults; caller fills source and port
    pub fn new_app(name: &str, source_type: SourceType, limits: ResourceLimits) -> Self {
        let now = now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: ServiceKind::App,
            name: name.to_string(),
            status: ServiceStatus::Created,
            source_type,
            source_url: None,
            branch: "main".to_string(),
            root_directory: ".".to_string(),
            container_id: None,
            image_ref: None,
            port: None,
            internal_port: 3000,
            limits,
            resource_preset: "micro".to_string(),
            restart_policy: "on-failure".to_string(),
            env_vars: HashMap::new(),
            overrides: BuildOverrides::default(),
            framework: None,
            startup_script: None,
            last_deployed_at: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Whether the proxy may forward traffic to this service
    pub fn is_live(&self) -> bool {
        match self.status {
            ServiceStatus::Running => self.port.is_some(),
            // A redeploy keeps the previous container serving until eviction
            ServiceStatus::Building => self.port.is_some() && self.container_id.is_some(),
            _ => false,
        }
    }
}

/// One deploy attempt for a service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub id: String,
    pub service_id: String,
    pub status: DeploymentStatus,
    pub image_ref: Option<String>,
    pub build_log: String,
    pub commit_sha: Option<String>,
    pub branch: Option<String>,
    pub duration_secs: Option<f64>,
    pub triggered_by: String,
    pub started_at: String,
    pub finished_at: Option<String>,
}

/// A stats sample appended by the metrics sampler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    pub id: i64,
    pub service_id: String,
    pub cpu_percent: f64,
    pub memory_used_bytes: i64,
    pub memory_limit_bytes: i64,
    pub net_rx_bytes: i64,
    pub net_tx_bytes: i64,
    pub pid_count: i64,
    pub created_at: String,
}

/// Audit trail entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: i64,
    pub action: String,
    pub service_id: Option<String>,
    pub service_name: Option<String>,
    pub details: String,
    pub created_at: String,
}

const SERVICE_COLUMNS: &str = "id, kind, name, status, source_type, source_url, branch,
    root_directory, container_id, image_ref, port, internal_port, cpu_limit, memory_limit,
    resource_preset, restart_policy, env_vars, overrides, framework, startup_script,
    last_deployed_at, created_at, updated_at";

const DEPLOYMENT_COLUMNS: &str = "id, service_id, status, image_ref, build_log, commit_sha,
    branch, duration_secs, triggered_by, started_at, finished_at";

fn row_to_service(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServiceRecord> {
    let env_json: String = row.get(16)?;
    let overrides_json: String = row.get(17)?;
    Ok(ServiceRecord {
        id: row.get(0)?,
        kind: row.get(1)?,
        name: row.get(2)?,
        status: row.get(3)?,
        source_type: row.get(4)?,
        source_url: row.get(5)?,
        branch: row.get(6)?,
        root_directory: row.get(7)?,
        container_id: row.get(8)?,
        image_ref: row.get(9)?,
        port: row.get(10)?,
        internal_port: row.get(11)?,
        limits: ResourceLimits {
            cpu: row.get(12)?,
            memory: row.get(13)?,
        },
        resource_preset: row.get(14)?,
        restart_policy: row.get(15)?,
        env_vars: serde_json::from_str(&env_json).unwrap_or_default(),
        overrides: serde_json::from_str(&overrides_json).unwrap_or_default(),
        framework: row.get(18)?,
        startup_script: row.get(19)?,
        last_deployed_at: row.get(20)?,
        created_at: row.get(21)?,
        updated_at: row.get(22)?,
    })
}

fn row_to_deployment(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeploymentRecord> {
    Ok(DeploymentRecord {
        id: row.get(0)?,
        service_id: row.get(1)?,
        status: row.get(2)?,
        image_ref: row.get(3)?,
        build_log: row.get(4)?,
        commit_sha: row.get(5)?,
        branch: row.get(6)?,
        duration_secs: row.get(7)?,
        triggered_by: row.get(8)?,
        started_at: row.get(9)?,
        finished_at: row.get(10)?,
    })
}

/// Column named by a `UNIQUE constraint failed: services.<column>` error
fn violated_column(err: &rusqlite::Error) -> Option<&str> {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => message
            .strip_prefix("UNIQUE constraint failed: ")
            .and_then(|columns| columns.split(", ").next())
            .and_then(|column| column.split('.').nth(1)),
        _ => None,
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Fixed-width RFC 3339 (microseconds, `Z`), so text order is time order
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now() -> String {
    timestamp(Utc::now())
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: initial schema
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS services (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL DEFAULT 'app',
                name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                status TEXT NOT NULL DEFAULT 'created',
                source_type TEXT NOT NULL,
                source_url TEXT,
                branch TEXT NOT NULL DEFAULT 'main',
                root_directory TEXT NOT NULL DEFAULT '.',
                container_id TEXT,
                image_ref TEXT,
                port INTEGER UNIQUE,
                internal_port INTEGER NOT NULL DEFAULT 3000,
                cpu_limit REAL NOT NULL,
                memory_limit INTEGER NOT NULL,
                resource_preset TEXT NOT NULL DEFAULT 'micro',
                restart_policy TEXT NOT NULL DEFAULT 'on-failure',
                env_vars TEXT NOT NULL DEFAULT '{}',
                overrides TEXT NOT NULL DEFAULT '{}',
                framework TEXT,
                startup_script TEXT,
                last_deployed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                service_id TEXT NOT NULL REFERENCES services(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'pending',
                image_ref TEXT,
                build_log TEXT NOT NULL DEFAULT '',
                commit_sha TEXT,
                branch TEXT,
                duration_secs REAL,
                triggered_by TEXT NOT NULL DEFAULT 'manual',
                started_at TEXT NOT NULL,
                finished_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_deployments_service
                ON deployments(service_id, started_at);

            -- At most one in-flight build per service
            CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_one_building
                ON deployments(service_id) WHERE status = 'building';

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service_id TEXT NOT NULL REFERENCES services(id) ON DELETE CASCADE,
                cpu_percent REAL NOT NULL,
                memory_used INTEGER NOT NULL,
                memory_limit INTEGER NOT NULL,
                net_rx INTEGER NOT NULL,
                net_tx INTEGER NOT NULL,
                pids INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_metrics_service
                ON metrics(service_id, created_at);

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action TEXT NOT NULL,
                service_id TEXT,
                service_name TEXT,
                details TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    // ==================== Service Operations ====================

    /// Insert a new service unless its name (case-insensitive) or port is
    /// already taken
    pub fn try_create_service(&self, service: &ServiceRecord) -> Result<CreateOutcome> {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO services (id, kind, name, status, source_type, source_url, branch,
                root_directory, container_id, image_ref, port, internal_port, cpu_limit,
                memory_limit, resource_preset, restart_policy, env_vars, overrides, framework,
                startup_script, last_deployed_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
            params![
                service.id,
                service.kind,
                service.name,
                service.status,
                service.source_type,
                service.source_url,
                service.branch,
                service.root_directory,
                service.container_id,
                service.image_ref,
                service.port,
                service.internal_port,
                service.limits.cpu,
                service.limits.memory,
                service.resource_preset,
                service.restart_policy,
                serde_json::to_string(&service.env_vars)?,
                serde_json::to_string(&service.overrides)?,
                service.framework,
                service.startup_script,
                service.last_deployed_at,
                service.created_at,
                service.updated_at,
            ],
        );

        match result {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(e) if is_constraint_violation(&e) => match violated_column(&e) {
                Some("port") => Ok(CreateOutcome::PortTaken),
                _ => Ok(CreateOutcome::NameTaken),
            },
            Err(e) => Err(e).context("Failed to create service"),
        }
    }

    pub fn get_service(&self, id: &str) -> Result<Option<ServiceRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM services WHERE id = ?1", SERVICE_COLUMNS),
            params![id],
            row_to_service,
        )
        .optional()
        .context("Failed to get service")
    }

    /// Case-insensitive lookup by name, across both service kinds
    pub fn get_service_by_name(&self, name: &str) -> Result<Option<ServiceRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM services WHERE name = ?1", SERVICE_COLUMNS),
            params![name],
            row_to_service,
        )
        .optional()
        .context("Failed to get service by name")
    }

    pub fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM services ORDER BY created_at, name",
            SERVICE_COLUMNS
        ))?;
        let services = stmt
            .query_map([], row_to_service)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(services)
    }

    pub fn list_services_by_status(&self, status: ServiceStatus) -> Result<Vec<ServiceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM services WHERE status = ?1 ORDER BY created_at, name",
            SERVICE_COLUMNS
        ))?;
        let services = stmt
            .query_map(params![status], row_to_service)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(services)
    }

    /// Every host port currently recorded against a service
    pub fn allocated_ports(&self) -> Result<Vec<u16>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT port FROM services WHERE port IS NOT NULL")?;
        let ports = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<u16>, _>>()?;
        Ok(ports)
    }

    pub fn update_service_status(&self, id: &str, status: ServiceStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE services SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, now(), id],
        )?;
        Ok(())
    }

    /// Record new container wiring after a successful create/start
    pub fn set_service_container(
        &self,
        id: &str,
        container_id: &str,
        image_ref: &str,
        port: u16,
        status: ServiceStatus,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE services SET container_id = ?1, image_ref = ?2, port = ?3, status = ?4,
                updated_at = ?5
             WHERE id = ?6",
            params![container_id, image_ref, port, status, now(), id],
        )?;
        Ok(())
    }

    /// Forget the container handle (after eviction or removal)
    pub fn clear_service_container(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE services SET container_id = NULL, updated_at = ?1 WHERE id = ?2",
            params![now(), id],
        )?;
        Ok(())
    }

    pub fn set_service_port(&self, id: &str, port: u16) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE services SET port = ?1, updated_at = ?2 WHERE id = ?3",
            params![port, now(), id],
        )?;
        Ok(())
    }

    pub fn set_service_framework(&self, id: &str, framework: &str, internal_port: u16) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE services SET framework = ?1, internal_port = ?2, updated_at = ?3 WHERE id = ?4",
            params![framework, internal_port, now(), id],
        )?;
        Ok(())
    }

    pub fn mark_deployed(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let ts = now();
        conn.execute(
            "UPDATE services SET last_deployed_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![ts, id],
        )?;
        Ok(())
    }

    pub fn update_service_env(&self, id: &str, env: &HashMap<String, String>) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE services SET env_vars = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(env)?, now(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn update_service_resources(&self, id: &str, limits: ResourceLimits, preset: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE services SET cpu_limit = ?1, memory_limit = ?2, resource_preset = ?3,
                updated_at = ?4
             WHERE id = ?5",
            params![limits.cpu, limits.memory, preset, now(), id],
        )?;
        Ok(())
    }

    pub fn update_service_build(
        &self,
        id: &str,
        overrides: &BuildOverrides,
        branch: &str,
        root_directory: &str,
        restart_policy: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE services SET overrides = ?1, branch = ?2, root_directory = ?3,
                restart_policy = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                serde_json::to_string(overrides)?,
                branch,
                root_directory,
                restart_policy,
                now(),
                id
            ],
        )?;
        Ok(())
    }

    pub fn delete_service(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM services WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    // ==================== Deployment Operations ====================

    pub fn create_deployment(&self, deployment: &DeploymentRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO deployments (id, service_id, status, image_ref, build_log, commit_sha,
                branch, duration_secs, triggered_by, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                deployment.id,
                deployment.service_id,
                deployment.status,
                deployment.image_ref,
                deployment.build_log,
                deployment.commit_sha,
                deployment.branch,
                deployment.duration_secs,
                deployment.triggered_by,
                deployment.started_at,
                deployment.finished_at,
            ],
        )
        .context("Failed to create deployment")?;
        Ok(())
    }

    pub fn set_deployment_status(&self, id: &str, status: DeploymentStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE deployments SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        Ok(())
    }

    pub fn set_deployment_commit(&self, id: &str, commit_sha: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE deployments SET commit_sha = ?1 WHERE id = ?2",
            params![commit_sha, id],
        )?;
        Ok(())
    }

    /// Close out a deployment with its final status and log
    pub fn finish_deployment(
        &self,
        id: &str,
        status: DeploymentStatus,
        build_log: &str,
        image_ref: Option<&str>,
        duration_secs: f64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE deployments SET status = ?1, build_log = ?2, image_ref = ?3,
                duration_secs = ?4, finished_at = ?5
             WHERE id = ?6",
            params![status, build_log, image_ref, duration_secs, now(), id],
        )?;
        Ok(())
    }

    pub fn get_deployment(&self, id: &str) -> Result<Option<DeploymentRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM deployments WHERE id = ?1", DEPLOYMENT_COLUMNS),
            params![id],
            row_to_deployment,
        )
        .optional()
        .context("Failed to get deployment")
    }

    /// Deployment history for a service, newest first
    pub fn list_deployments(&self, service_id: &str) -> Result<Vec<DeploymentRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM deployments WHERE service_id = ?1
             ORDER BY started_at DESC, rowid DESC",
            DEPLOYMENT_COLUMNS
        ))?;
        let deployments = stmt
            .query_map(params![service_id], row_to_deployment)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(deployments)
    }

    /// Successful deployments that still reference an image, newest first
    pub fn list_deployment_images(&self, service_id: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, image_ref FROM deployments
             WHERE service_id = ?1 AND status = 'success' AND image_ref IS NOT NULL
             ORDER BY started_at DESC, rowid DESC",
        )?;
        let images = stmt
            .query_map(params![service_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(images)
    }

    /// Drop the image reference of a deployment whose image was pruned
    pub fn clear_deployment_image(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE deployments SET image_ref = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Number of deployments currently marked building, across all services
    pub fn count_building_deployments(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM deployments WHERE status = 'building'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Fail deployments and services left in `building` by a previous process
    pub fn fail_interrupted_builds(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let ts = now();
        let deployments = conn.execute(
            "UPDATE deployments SET status = 'failed', finished_at = ?1,
                build_log = build_log || '\n[interrupted by platform restart]'
             WHERE status IN ('building', 'pending')",
            params![ts],
        )?;
        conn.execute(
            "UPDATE services SET status = CASE WHEN container_id IS NULL THEN 'error' ELSE 'running' END,
                updated_at = ?1
             WHERE status = 'building'",
            params![ts],
        )?;
        Ok(deployments)
    }

    // ==================== Settings Operations ====================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to get setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    // ==================== Metrics Operations ====================

    pub fn insert_metric(&self, metric: &MetricRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO metrics (service_id, cpu_percent, memory_used, memory_limit, net_rx,
                net_tx, pids, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                metric.service_id,
                metric.cpu_percent,
                metric.memory_used_bytes,
                metric.memory_limit_bytes,
                metric.net_rx_bytes,
                metric.net_tx_bytes,
                metric.pid_count,
                metric.created_at,
            ],
        )?;
        Ok(())
    }

    /// Most recent samples for a service, newest first
    pub fn list_metrics(&self, service_id: &str, limit: usize) -> Result<Vec<MetricRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, service_id, cpu_percent, memory_used, memory_limit, net_rx, net_tx, pids,
                    created_at
             FROM metrics WHERE service_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let metrics = stmt
            .query_map(params![service_id, limit as i64], |row| {
                Ok(MetricRecord {
                    id: row.get(0)?,
                    service_id: row.get(1)?,
                    cpu_percent: row.get(2)?,
                    memory_used_bytes: row.get(3)?,
                    memory_limit_bytes: row.get(4)?,
                    net_rx_bytes: row.get(5)?,
                    net_tx_bytes: row.get(6)?,
                    pid_count: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(metrics)
    }

    /// Remove samples older than `days`
    pub fn prune_metrics(&self, days: u32) -> Result<usize> {
        let cutoff = timestamp(Utc::now() - chrono::Duration::days(days as i64));
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM metrics WHERE created_at < ?1", params![cutoff])?;
        Ok(removed)
    }

    // ==================== Audit Operations ====================

    pub fn insert_audit(
        &self,
        action: &str,
        service_id: Option<&str>,
        service_name: Option<&str>,
        details: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_log (action, service_id, service_name, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![action, service_id, service_name, details, now()],
        )?;
        Ok(())
    }

    pub fn list_audit(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, action, service_id, service_name, details, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit as i64], |row| {
                Ok(AuditRecord {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    service_id: row.get(2)?,
                    service_name: row.get(3)?,
                    details: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}
