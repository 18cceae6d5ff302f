//! Skiff store: the repository contract for Application and Template records,
//! plus an in-memory implementation used by tests and embedded setups.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use skiff_core::{AppId, Application, PlatformError, Template};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Distinguished from transport failures so callers can treat absence as data.
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
}

impl From<StoreError> for PlatformError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => PlatformError::NotFound(what),
            StoreError::Backend(msg) => PlatformError::Store(msg),
        }
    }
}

/// Persistence for Application and Template records.
///
/// Single-record operations are expected to be atomic; nothing more.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn find_by_id(&self, id: AppId) -> Result<Application, StoreError>;

    /// Any application with this name, regardless of owner.
    async fn find_by_name(&self, name: &str) -> Result<Application, StoreError>;

    async fn find_by_name_and_owner(&self, name: &str, owner: &str) -> Result<Application, StoreError>;

    /// Persist a new record. A nil id is replaced with a fresh one; the stored record is returned.
    async fn insert(&self, app: Application) -> Result<Application, StoreError>;

    async fn update_by_id(&self, id: AppId, app: &Application) -> Result<(), StoreError>;

    async fn find_template_by_code(&self, code: &str) -> Result<Template, StoreError>;

    async fn find_all_available_templates(&self) -> Result<Vec<Template>, StoreError>;
}

/// Lookup that maps `NotFound` to `None` and keeps other failures as errors.
pub fn optional<T>(res: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[derive(Default)]
struct Inner {
    apps: HashMap<AppId, Application>,
    templates: BTreeMap<String, Template>,
}

/// In-memory store. Counts application mutations so tests can assert "nothing was written".
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    mutations: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_templates(templates: impl IntoIterator<Item = Template>) -> Self {
        let me = Self::new();
        if let Ok(mut g) = me.inner.lock() {
            for t in templates {
                g.templates.insert(t.code.clone(), t);
            }
        }
        me
    }

    pub fn put_template(&self, t: Template) -> Result<(), StoreError> {
        self.lock()?.templates.insert(t.code.clone(), t);
        Ok(())
    }

    /// Number of insert/update calls on applications.
    pub fn mutations(&self) -> u64 { self.mutations.load(Ordering::SeqCst) }

    pub fn applications(&self) -> Vec<Application> {
        self.lock().map(|g| g.apps.values().cloned().collect()).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn find_by_id(&self, id: AppId) -> Result<Application, StoreError> {
        self.lock()?.apps.get(&id).cloned().ok_or_else(|| StoreError::NotFound(format!("application {}", id)))
    }

    async fn find_by_name(&self, name: &str) -> Result<Application, StoreError> {
        let g = self.lock()?;
        g.apps
            .values()
            .filter(|a| a.name == name)
            .min_by_key(|a| a.created_at)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("application {}", name)))
    }

    async fn find_by_name_and_owner(&self, name: &str, owner: &str) -> Result<Application, StoreError> {
        let g = self.lock()?;
        g.apps
            .values()
            .find(|a| a.name == name && a.owner == owner)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("application {} owned by {}", name, owner)))
    }

    async fn insert(&self, mut app: Application) -> Result<Application, StoreError> {
        let mut g = self.lock()?;
        if app.id.is_nil() {
            app.id = AppId::new();
        }
        if g.apps.contains_key(&app.id) {
            return Err(StoreError::Backend(format!("duplicate application id {}", app.id)));
        }
        let now = Utc::now();
        app.created_at = now;
        app.updated_at = now;
        g.apps.insert(app.id, app.clone());
        self.mutations.fetch_add(1, Ordering::SeqCst);
        debug!(app = %app.name, app_id = %app.id, "store: inserted application");
        Ok(app)
    }

    async fn update_by_id(&self, id: AppId, app: &Application) -> Result<(), StoreError> {
        let mut g = self.lock()?;
        let slot = g.apps.get_mut(&id).ok_or_else(|| StoreError::NotFound(format!("application {}", id)))?;
        let mut next = app.clone();
        next.id = id;
        next.created_at = slot.created_at;
        *slot = next;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        debug!(app = %app.name, app_id = %id, state = %app.state, "store: updated application");
        Ok(())
    }

    async fn find_template_by_code(&self, code: &str) -> Result<Template, StoreError> {
        self.lock()?.templates.get(code).cloned().ok_or_else(|| StoreError::NotFound(format!("template {}", code)))
    }

    async fn find_all_available_templates(&self) -> Result<Vec<Template>, StoreError> {
        Ok(self.lock()?.templates.values().filter(|t| t.available).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::{AppKind, AppState};

    fn template(code: &str, available: bool) -> Template {
        Template {
            code: code.into(),
            description: String::new(),
            kind: AppKind::Management,
            image: "img".into(),
            port: 80,
            required_envs: vec![],
            optional_envs: vec![],
            default_envs: vec![],
            persistence_path: None,
            volume_size: None,
            available,
        }
    }

    #[tokio::test]
    async fn insert_assigns_id_and_counts_mutations() {
        let s = MemoryStore::new();
        let app = s.insert(Application::draft("alpha", "u1", AppKind::Web)).await.unwrap();
        assert!(!app.id.is_nil());
        assert_eq!(s.mutations(), 1);
        let mut again = s.find_by_id(app.id).await.unwrap();
        again.state = AppState::Building;
        s.update_by_id(app.id, &again).await.unwrap();
        assert_eq!(s.mutations(), 2);
        assert_eq!(s.find_by_name("alpha").await.unwrap().state, AppState::Building);
    }

    #[tokio::test]
    async fn not_found_is_distinguished() {
        let s = MemoryStore::new();
        let err = s.find_by_name_and_owner("alpha", "u1").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(optional(s.find_by_name("alpha").await).unwrap().is_none());
        let err = s.update_by_id(AppId::new(), &Application::draft("x", "u", AppKind::Web)).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(s.mutations(), 0);
    }

    #[tokio::test]
    async fn owner_scoped_lookup() {
        let s = MemoryStore::new();
        s.insert(Application::draft("alpha", "u1", AppKind::Storage)).await.unwrap();
        assert!(s.find_by_name_and_owner("alpha", "u1").await.is_ok());
        assert!(s.find_by_name_and_owner("alpha", "u2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn only_available_templates_are_listed() {
        let s = MemoryStore::with_templates([template("a", true), template("b", false)]);
        let all = s.find_all_available_templates().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].code, "a");
        assert!(s.find_template_by_code("b").await.is_ok());
        assert!(s.find_template_by_code("c").await.unwrap_err().is_not_found());
    }
}
