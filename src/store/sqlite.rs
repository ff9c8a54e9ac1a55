use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use slipway_common::{
    ArtifactType, Assembly, AssemblyStatus, Component, Image, ImageStatus, LogRecord, Workflow,
};

use super::{ImageUpdate, MetadataStore, NewAssembly, NewComponent, NewImage};

/// Async-safe handle to the metadata database.
///
/// Wraps `SqliteDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<SqliteDb>>,
}

impl StoreHandle {
    pub fn new(db: SqliteDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(SqliteDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(SqliteDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SqliteDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct SqliteDb {
    conn: Connection,
}

const ASSEMBLY_COLUMNS: &str =
    "id, uuid, name, plan_id, workflow, status, application_uri, image_id, tenant, created_at";

const IMAGE_COLUMNS: &str = "id, uuid, name, status, external_ref, docker_image_name, source_format, artifact_type, base_image_id, tenant, created_at";

impl SqliteDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS images (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'QUEUED',
                    external_ref TEXT,
                    docker_image_name TEXT,
                    source_format TEXT NOT NULL DEFAULT 'dockerfile',
                    artifact_type TEXT NOT NULL,
                    base_image_id INTEGER REFERENCES images(id) ON DELETE SET NULL,
                    tenant TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS assemblies (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    plan_id INTEGER NOT NULL,
                    workflow TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'QUEUED',
                    application_uri TEXT,
                    image_id INTEGER REFERENCES images(id) ON DELETE SET NULL,
                    tenant TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS components (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    assembly_id INTEGER NOT NULL REFERENCES assemblies(id) ON DELETE CASCADE,
                    component_type TEXT NOT NULL,
                    name TEXT NOT NULL,
                    resource_uri TEXT,
                    heat_stack_id TEXT
                );

                CREATE TABLE IF NOT EXISTS logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    resource_uuid TEXT NOT NULL,
                    stage TEXT NOT NULL,
                    location TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS status_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    assembly_id INTEGER NOT NULL REFERENCES assemblies(id) ON DELETE CASCADE,
                    status TEXT NOT NULL,
                    recorded_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_assemblies_plan ON assemblies(plan_id);
                CREATE INDEX IF NOT EXISTS idx_components_assembly ON components(assembly_id);
                CREATE INDEX IF NOT EXISTS idx_logs_resource ON logs(resource_uuid);
                CREATE INDEX IF NOT EXISTS idx_status_history_assembly ON status_history(assembly_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Assemblies ───────────────────────────────────────────────────

    pub fn create_assembly(&self, new: &NewAssembly) -> Result<Assembly> {
        self.create_assembly_at(new, Utc::now())
    }

    /// Insert with an explicit creation time; twin GC orders by it.
    pub fn create_assembly_at(&self, new: &NewAssembly, created_at: DateTime<Utc>) -> Result<Assembly> {
        let uuid = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO assemblies (uuid, name, plan_id, workflow, status, tenant, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    uuid,
                    new.name,
                    new.plan_id,
                    new.workflow.to_csv(),
                    AssemblyStatus::Queued.as_str(),
                    new.tenant,
                    created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert assembly")?;
        let id = self.conn.last_insert_rowid();
        self.get_assembly(id)?
            .context("Assembly not found after insert")
    }

    pub fn get_assembly(&self, id: i64) -> Result<Option<Assembly>> {
        let sql = format!("SELECT {ASSEMBLY_COLUMNS} FROM assemblies WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], AssemblyRow::from_row)
            .optional()
            .context("Failed to query assembly")?;
        row.map(AssemblyRow::into_assembly).transpose()
    }

    pub fn list_assemblies_for_plan(&self, plan_id: i64) -> Result<Vec<Assembly>> {
        let sql =
            format!("SELECT {ASSEMBLY_COLUMNS} FROM assemblies WHERE plan_id = ?1 ORDER BY id");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_assemblies_for_plan")?;
        let rows = stmt
            .query_map(params![plan_id], AssemblyRow::from_row)
            .context("Failed to query assemblies")?;
        let mut assemblies = Vec::new();
        for row in rows {
            assemblies.push(row.context("Failed to read assembly row")?.into_assembly()?);
        }
        Ok(assemblies)
    }

    pub fn set_assembly_status(&self, id: i64, status: AssemblyStatus) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE assemblies SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update assembly status")?;
        if changed == 0 {
            anyhow::bail!("Assembly {} not found", id);
        }
        self.conn
            .execute(
                "INSERT INTO status_history (assembly_id, status, recorded_at) VALUES (?1, ?2, ?3)",
                params![id, status.as_str(), Utc::now().to_rfc3339()],
            )
            .context("Failed to record status history")?;
        Ok(())
    }

    /// Every status written for an Assembly, oldest first.
    pub fn status_history(&self, id: i64) -> Result<Vec<AssemblyStatus>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status FROM status_history WHERE assembly_id = ?1 ORDER BY id")
            .context("Failed to prepare status_history")?;
        let rows = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))
            .context("Failed to query status history")?;
        let mut out = Vec::new();
        for row in rows {
            let s = row.context("Failed to read status row")?;
            out.push(AssemblyStatus::from_str(&s).map_err(|e| anyhow::anyhow!(e))?);
        }
        Ok(out)
    }

    pub fn set_application_uri(&self, id: i64, uri: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE assemblies SET application_uri = ?1 WHERE id = ?2",
                params![uri, id],
            )
            .context("Failed to update application uri")?;
        Ok(())
    }

    pub fn set_assembly_image(&self, id: i64, image_id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE assemblies SET image_id = ?1 WHERE id = ?2",
                params![image_id, id],
            )
            .context("Failed to link assembly image")?;
        Ok(())
    }

    pub fn delete_assembly(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM assemblies WHERE id = ?1", params![id])
            .context("Failed to delete assembly")?;
        Ok(())
    }

    // ── Images ───────────────────────────────────────────────────────

    pub fn create_image(&self, new: &NewImage) -> Result<Image> {
        let uuid = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO images (uuid, name, status, external_ref, docker_image_name, source_format, artifact_type, base_image_id, tenant, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    uuid,
                    new.name,
                    new.status.as_str(),
                    new.external_ref,
                    new.docker_image_name,
                    new.source_format,
                    new.artifact_type.as_str(),
                    new.base_image_id,
                    new.tenant,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to insert image")?;
        let id = self.conn.last_insert_rowid();
        self.get_image(id)?.context("Image not found after insert")
    }

    pub fn get_image(&self, id: i64) -> Result<Option<Image>> {
        let sql = format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], ImageRow::from_row)
            .optional()
            .context("Failed to query image")?;
        row.map(ImageRow::into_image).transpose()
    }

    pub fn update_image(&self, id: i64, update: &ImageUpdate) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE images SET
                    status = COALESCE(?1, status),
                    external_ref = COALESCE(?2, external_ref),
                    docker_image_name = COALESCE(?3, docker_image_name)
                 WHERE id = ?4",
                params![
                    update.status.map(|s| s.as_str()),
                    update.external_ref,
                    update.docker_image_name,
                    id,
                ],
            )
            .context("Failed to update image")?;
        if changed == 0 {
            anyhow::bail!("Image {} not found", id);
        }
        Ok(())
    }

    pub fn delete_image(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM images WHERE id = ?1", params![id])
            .context("Failed to delete image")?;
        Ok(())
    }

    // ── Components ───────────────────────────────────────────────────

    pub fn find_component(&self, assembly_id: i64, component_type: &str) -> Result<Option<Component>> {
        self.conn
            .query_row(
                "SELECT id, assembly_id, component_type, name, resource_uri, heat_stack_id
                 FROM components WHERE assembly_id = ?1 AND component_type = ?2
                 ORDER BY id LIMIT 1",
                params![assembly_id, component_type],
                component_from_row,
            )
            .optional()
            .context("Failed to query component")
    }

    pub fn list_components(&self, assembly_id: i64) -> Result<Vec<Component>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, assembly_id, component_type, name, resource_uri, heat_stack_id
                 FROM components WHERE assembly_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_components")?;
        let rows = stmt
            .query_map(params![assembly_id], component_from_row)
            .context("Failed to query components")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read component row")?);
        }
        Ok(out)
    }

    pub fn create_component(&self, new: &NewComponent) -> Result<Component> {
        self.conn
            .execute(
                "INSERT INTO components (assembly_id, component_type, name, resource_uri, heat_stack_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new.assembly_id,
                    new.component_type,
                    new.name,
                    new.resource_uri,
                    new.heat_stack_id,
                ],
            )
            .context("Failed to insert component")?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, assembly_id, component_type, name, resource_uri, heat_stack_id
                 FROM components WHERE id = ?1",
                params![id],
                component_from_row,
            )
            .context("Component not found after insert")
    }

    pub fn delete_components(&self, assembly_id: i64) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM components WHERE assembly_id = ?1",
                params![assembly_id],
            )
            .context("Failed to delete components")?;
        Ok(())
    }

    // ── Logs ─────────────────────────────────────────────────────────

    pub fn add_log(&self, resource_uuid: &str, stage: &str, location: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO logs (resource_uuid, stage, location) VALUES (?1, ?2, ?3)",
                params![resource_uuid, stage, location],
            )
            .context("Failed to insert log record")?;
        Ok(())
    }

    pub fn list_logs(&self, resource_uuid: &str) -> Result<Vec<LogRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, resource_uuid, stage, location FROM logs
                 WHERE resource_uuid = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_logs")?;
        let rows = stmt
            .query_map(params![resource_uuid], |row| {
                Ok(LogRecord {
                    id: row.get(0)?,
                    resource_uuid: row.get(1)?,
                    stage: row.get(2)?,
                    location: row.get(3)?,
                })
            })
            .context("Failed to query logs")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read log row")?);
        }
        Ok(out)
    }

    pub fn take_logs(&self, resource_uuid: &str) -> Result<Vec<LogRecord>> {
        let logs = self.list_logs(resource_uuid)?;
        self.conn
            .execute(
                "DELETE FROM logs WHERE resource_uuid = ?1",
                params![resource_uuid],
            )
            .context("Failed to delete log records")?;
        Ok(logs)
    }
}

fn component_from_row(row: &Row<'_>) -> rusqlite::Result<Component> {
    Ok(Component {
        id: row.get(0)?,
        assembly_id: row.get(1)?,
        component_type: row.get(2)?,
        name: row.get(3)?,
        resource_uri: row.get(4)?,
        heat_stack_id: row.get(5)?,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp '{}'", s))?
        .with_timezone(&Utc))
}

struct AssemblyRow {
    id: i64,
    uuid: String,
    name: String,
    plan_id: i64,
    workflow: String,
    status: String,
    application_uri: Option<String>,
    image_id: Option<i64>,
    tenant: String,
    created_at: String,
}

impl AssemblyRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            uuid: row.get(1)?,
            name: row.get(2)?,
            plan_id: row.get(3)?,
            workflow: row.get(4)?,
            status: row.get(5)?,
            application_uri: row.get(6)?,
            image_id: row.get(7)?,
            tenant: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_assembly(self) -> Result<Assembly> {
        let workflow = Workflow::from_str(&self.workflow)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse assembly workflow")?;
        let status = AssemblyStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse assembly status")?;
        Ok(Assembly {
            id: self.id,
            uuid: self.uuid,
            name: self.name,
            plan_id: self.plan_id,
            workflow,
            status,
            application_uri: self.application_uri,
            image_id: self.image_id,
            tenant: self.tenant,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

struct ImageRow {
    id: i64,
    uuid: String,
    name: String,
    status: String,
    external_ref: Option<String>,
    docker_image_name: Option<String>,
    source_format: String,
    artifact_type: String,
    base_image_id: Option<i64>,
    tenant: String,
    created_at: String,
}

impl ImageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            uuid: row.get(1)?,
            name: row.get(2)?,
            status: row.get(3)?,
            external_ref: row.get(4)?,
            docker_image_name: row.get(5)?,
            source_format: row.get(6)?,
            artifact_type: row.get(7)?,
            base_image_id: row.get(8)?,
            tenant: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_image(self) -> Result<Image> {
        let status = ImageStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse image status")?;
        let artifact_type = ArtifactType::from_str(&self.artifact_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse artifact type")?;
        Ok(Image {
            id: self.id,
            uuid: self.uuid,
            name: self.name,
            status,
            external_ref: self.external_ref,
            docker_image_name: self.docker_image_name,
            source_format: self.source_format,
            artifact_type,
            base_image_id: self.base_image_id,
            tenant: self.tenant,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

#[async_trait]
impl MetadataStore for StoreHandle {
    async fn get_assembly(&self, id: i64) -> Result<Option<Assembly>> {
        self.call(move |db| db.get_assembly(id)).await
    }

    async fn set_assembly_status(&self, id: i64, status: AssemblyStatus) -> Result<()> {
        self.call(move |db| db.set_assembly_status(id, status)).await
    }

    async fn set_application_uri(&self, id: i64, uri: &str) -> Result<()> {
        let uri = uri.to_string();
        self.call(move |db| db.set_application_uri(id, &uri)).await
    }

    async fn set_assembly_image(&self, id: i64, image_id: i64) -> Result<()> {
        self.call(move |db| db.set_assembly_image(id, image_id)).await
    }

    async fn list_assemblies_for_plan(&self, plan_id: i64) -> Result<Vec<Assembly>> {
        self.call(move |db| db.list_assemblies_for_plan(plan_id)).await
    }

    async fn delete_assembly(&self, id: i64) -> Result<()> {
        self.call(move |db| db.delete_assembly(id)).await
    }

    async fn get_image(&self, id: i64) -> Result<Option<Image>> {
        self.call(move |db| db.get_image(id)).await
    }

    async fn create_image(&self, new: NewImage) -> Result<Image> {
        self.call(move |db| db.create_image(&new)).await
    }

    async fn update_image(&self, id: i64, update: ImageUpdate) -> Result<()> {
        self.call(move |db| db.update_image(id, &update)).await
    }

    async fn delete_image(&self, id: i64) -> Result<()> {
        self.call(move |db| db.delete_image(id)).await
    }

    async fn find_component(
        &self,
        assembly_id: i64,
        component_type: &str,
    ) -> Result<Option<Component>> {
        let component_type = component_type.to_string();
        self.call(move |db| db.find_component(assembly_id, &component_type))
            .await
    }

    async fn create_component(&self, new: NewComponent) -> Result<Component> {
        self.call(move |db| db.create_component(&new)).await
    }

    async fn delete_components(&self, assembly_id: i64) -> Result<()> {
        self.call(move |db| db.delete_components(assembly_id)).await
    }

    async fn add_log(&self, resource_uuid: &str, stage: &str, location: &str) -> Result<()> {
        let (resource_uuid, stage, location) =
            (resource_uuid.to_string(), stage.to_string(), location.to_string());
        self.call(move |db| db.add_log(&resource_uuid, &stage, &location))
            .await
    }

    async fn take_logs(&self, resource_uuid: &str) -> Result<Vec<LogRecord>> {
        let resource_uuid = resource_uuid.to_string();
        self.call(move |db| db.take_logs(&resource_uuid)).await
    }
}
