//! Skiff persistence: SQLite store for application and template records.
//! Records are kept as JSON documents; lookup columns are denormalized next to them.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, histogram};
use rusqlite::{params, OptionalExtension};
use skiff_core::{AppId, Application, Template};
use skiff_store::{ResourceStore, StoreError};
use tracing::{debug, info};

pub struct SqliteStore {
    db: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let started = std::time::Instant::now();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
            }
        }
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path.display()))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::migrate(&db)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path = %path.display(), "persist: store opened");
        Ok(Self { db: Arc::new(Mutex::new(db)) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite")?;
        Self::migrate(&db)?;
        Ok(Self { db: Arc::new(Mutex::new(db)) })
    }

    fn migrate(db: &rusqlite::Connection) -> Result<()> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS applications (
                id         TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                owner      TEXT NOT NULL,
                state      TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                doc        TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_applications_name ON applications(name, created_at);
            CREATE INDEX IF NOT EXISTS idx_applications_name_owner ON applications(name, owner);
            CREATE TABLE IF NOT EXISTS templates (
                code      TEXT PRIMARY KEY,
                available INTEGER NOT NULL,
                doc       TEXT NOT NULL
            );",
        )
        .context("creating tables")
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }

    /// Insert or replace a template by code.
    pub fn put_template(&self, t: &Template) -> Result<()> {
        let doc = serde_json::to_string(t).context("serializing template")?;
        self.conn()?
            .execute(
                "INSERT INTO templates(code, available, doc) VALUES (?1, ?2, ?3)
                 ON CONFLICT(code) DO UPDATE SET available = excluded.available, doc = excluded.doc",
                params![t.code, t.available, doc],
            )
            .with_context(|| format!("upserting template {}", t.code))?;
        Ok(())
    }

    /// Import a YAML list of templates; returns how many were written.
    pub fn import_templates_yaml(&self, yaml: &str) -> Result<usize> {
        let templates: Vec<Template> = serde_yaml::from_str(yaml).context("parsing templates YAML")?;
        for t in &templates {
            self.put_template(t)?;
        }
        counter!("persist_templates_imported", templates.len() as u64);
        Ok(templates.len())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))?;
            f(&conn)
        })
        .await
        .context("sqlite task failed")?
    }
}

fn query_app(db: &rusqlite::Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Option<Application>> {
    let started = std::time::Instant::now();
    let doc: Option<String> = db.query_row(sql, args, |row| row.get(0)).optional()?;
    histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
    match doc {
        Some(d) => Ok(Some(serde_json::from_str(&d).context("decoding application document")?)),
        None => Ok(None),
    }
}

fn write_app(db: &rusqlite::Connection, app: &Application, insert: bool) -> Result<usize> {
    let started = std::time::Instant::now();
    let doc = serde_json::to_string(app).context("serializing application")?;
    let changed = if insert {
        db.execute(
            "INSERT INTO applications(id, name, owner, state, created_at, doc) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![app.id.to_string(), app.name, app.owner, app.state.as_str(), app.created_at.timestamp_millis(), doc],
        )?
    } else {
        db.execute(
            "UPDATE applications SET name = ?2, owner = ?3, state = ?4, doc = ?5 WHERE id = ?1",
            params![app.id.to_string(), app.name, app.owner, app.state.as_str(), doc],
        )?
    };
    histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
    counter!("persist_put_total", 1u64);
    Ok(changed)
}

fn backend(e: anyhow::Error) -> StoreError { StoreError::Backend(format!("{:#}", e)) }

#[async_trait]
impl ResourceStore for SqliteStore {
    async fn find_by_id(&self, id: AppId) -> Result<Application, StoreError> {
        let key = id.to_string();
        self.with_conn(move |db| query_app(db, "SELECT doc FROM applications WHERE id = ?1", &[&key]))
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("application {}", id)))
    }

    async fn find_by_name(&self, name: &str) -> Result<Application, StoreError> {
        let key = name.to_string();
        self.with_conn(move |db| query_app(db, "SELECT doc FROM applications WHERE name = ?1 ORDER BY created_at LIMIT 1", &[&key]))
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("application {}", name)))
    }

    async fn find_by_name_and_owner(&self, name: &str, owner: &str) -> Result<Application, StoreError> {
        let (n, o) = (name.to_string(), owner.to_string());
        self.with_conn(move |db| query_app(db, "SELECT doc FROM applications WHERE name = ?1 AND owner = ?2 LIMIT 1", &[&n, &o]))
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound(format!("application {} owned by {}", name, owner)))
    }

    async fn insert(&self, mut app: Application) -> Result<Application, StoreError> {
        if app.id.is_nil() {
            app.id = AppId::new();
        }
        let now = Utc::now();
        app.created_at = now;
        app.updated_at = now;
        let app = self.with_conn(move |db| write_app(db, &app, true).map(|_| app)).await.map_err(backend)?;
        debug!(app = %app.name, app_id = %app.id, "persist: inserted application");
        Ok(app)
    }

    async fn update_by_id(&self, id: AppId, app: &Application) -> Result<(), StoreError> {
        let mut next = app.clone();
        next.id = id;
        match self.with_conn(move |db| write_app(db, &next, false)).await.map_err(backend)? {
            0 => Err(StoreError::NotFound(format!("application {}", id))),
            _ => Ok(()),
        }
    }

    async fn find_template_by_code(&self, code: &str) -> Result<Template, StoreError> {
        let key = code.to_string();
        let doc: Option<String> = self
            .with_conn(move |db| Ok(db.query_row("SELECT doc FROM templates WHERE code = ?1", [&key], |row| row.get(0)).optional()?))
            .await
            .map_err(backend)?;
        let doc = doc.ok_or_else(|| StoreError::NotFound(format!("template {}", code)))?;
        serde_json::from_str(&doc).map_err(|e| StoreError::Backend(format!("decoding template {}: {}", code, e)))
    }

    async fn find_all_available_templates(&self) -> Result<Vec<Template>, StoreError> {
        self.with_conn(|db| {
            let mut stmt = db.prepare("SELECT doc FROM templates WHERE available = 1 ORDER BY code")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let doc: String = row.get(0)?;
                out.push(serde_json::from_str(&doc).context("decoding template document")?);
            }
            Ok(out)
        })
        .await
        .map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::{AppKind, AppState};

    const TEMPLATES: &str = r#"
- code: postgres
  kind: storage
  image: postgres:16
  port: 5432
  required_envs: [POSTGRES_PASSWORD]
  default_envs:
    - { key: PGDATA, value: /var/lib/postgresql/data/pgdata }
  persistence_path: /var/lib/postgresql/data
- code: adminer
  kind: management
  image: adminer:4
  port: 8080
  available: false
"#;

    #[tokio::test]
    async fn round_trips_application_and_updates_state() {
        let s = SqliteStore::open_in_memory().unwrap();
        let app = s.insert(Application::draft("alpha", "u1", AppKind::Storage)).await.unwrap();
        let mut loaded = s.find_by_name_and_owner("alpha", "u1").await.unwrap();
        assert_eq!(loaded.id, app.id);
        loaded.state = AppState::Starting;
        s.update_by_id(app.id, &loaded).await.unwrap();
        assert_eq!(s.find_by_id(app.id).await.unwrap().state, AppState::Starting);
        assert!(s.find_by_name_and_owner("alpha", "u2").await.unwrap_err().is_not_found());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_writers_share_the_connection() {
        let s = Arc::new(SqliteStore::open_in_memory().unwrap());
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let s = Arc::clone(&s);
                tokio::spawn(async move { s.insert(Application::draft(format!("app-{i}"), "u1", AppKind::Storage)).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        for i in 0..8 {
            assert!(s.find_by_name_and_owner(&format!("app-{i}"), "u1").await.is_ok());
        }
    }

    #[tokio::test]
    async fn update_of_unknown_id_is_not_found() {
        let s = SqliteStore::open_in_memory().unwrap();
        let err = s.update_by_id(AppId::new(), &Application::draft("x", "u", AppKind::Web)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn imports_templates_and_filters_unavailable() {
        let s = SqliteStore::open_in_memory().unwrap();
        assert_eq!(s.import_templates_yaml(TEMPLATES).unwrap(), 2);
        let available = s.find_all_available_templates().await.unwrap();
        assert_eq!(available.len(), 1);
        let pg = s.find_template_by_code("postgres").await.unwrap();
        assert_eq!(pg.required_envs, vec!["POSTGRES_PASSWORD".to_string()]);
        assert_eq!(pg.persistence_path.as_deref(), Some("/var/lib/postgresql/data"));
        assert!(s.find_template_by_code("adminer").await.is_ok());
    }

    #[test]
    fn open_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("skiff-test-{}", AppId::new()));
        let path = dir.join("nested").join("skiff.db");
        let _ = SqliteStore::open(&path).unwrap();
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(dir);
    }
}
