//! Skiff core types: the application record, its lifecycle state machine,
//! templates, and the pieces every other crate shares (labels, config, errors).

#![forbid(unsafe_code)]

pub mod config;
pub mod envelope;
pub mod error;
pub mod labels;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use config::PlatformConfig;
pub use error::{ErrorKind, PlatformError};

/// Durable application identifier, assigned by the store on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(pub Uuid);

impl AppId {
    pub fn new() -> Self { Self(Uuid::new_v4()) }
    pub fn nil() -> Self { Self(Uuid::nil()) }
    pub fn is_nil(&self) -> bool { self.0.is_nil() }

    /// First eight hex digits; enough to keep derived resource names apart.
    pub fn short(&self) -> String { self.0.simple().to_string()[..8].to_string() }
}

impl Default for AppId {
    fn default() -> Self { Self::nil() }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

impl FromStr for AppId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Uuid::parse_str(s).map(Self) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    Web,
    Storage,
    Management,
}

impl AppKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AppKind::Web => "web",
            AppKind::Storage => "storage",
            AppKind::Management => "management",
        }
    }
}

impl fmt::Display for AppKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

/// Lifecycle of an application as seen by the orchestrator.
///
/// ```text
/// Created ──► Building ──► Starting ──► Running ──► Updating
///    │           │            │                        │
///    └───────────┴──► Failed ◄┘◄───────────────────────┘
/// ```
///
/// `Created ──► Starting` is taken by template flows, which need no build.
/// A failed application may be rebuilt (`Failed ──► Building`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Created,
    Building,
    Starting,
    Running,
    Updating,
    Failed,
}

impl AppState {
    pub fn as_str(self) -> &'static str {
        match self {
            AppState::Created => "created",
            AppState::Building => "building",
            AppState::Starting => "starting",
            AppState::Running => "running",
            AppState::Updating => "updating",
            AppState::Failed => "failed",
        }
    }

    /// A new build may only be requested while nothing else is in flight.
    pub fn can_request_build(self) -> bool {
        matches!(self, AppState::Created | AppState::Failed | AppState::Running)
    }

    /// State a build request moves the application into.
    pub fn build_target(self) -> Option<AppState> {
        match self {
            AppState::Created | AppState::Failed => Some(AppState::Building),
            AppState::Running => Some(AppState::Updating),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: AppState) -> bool {
        use AppState::*;
        matches!(
            (self, next),
            (Created, Building)
                | (Created, Starting)
                | (Created, Failed)
                | (Building, Starting)
                | (Building, Failed)
                | (Updating, Starting)
                | (Updating, Failed)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Updating)
                | (Failed, Building)
        )
    }

    pub fn is_build_in_flight(self) -> bool {
        matches!(self, AppState::Building | AppState::Updating)
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

impl FromStr for EnvVar {
    type Err = String;

    /// Parses `KEY=VALUE`; the value may itself contain `=`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok(EnvVar::new(k.trim(), v)),
            _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
        }
    }
}

/// First occurrence wins on read.
pub fn env_lookup<'a>(envs: &'a [EnvVar], key: &str) -> Option<&'a str> {
    envs.iter().find(|e| e.key == key).map(|e| e.value.as_str())
}

/// Append template defaults after the supplied envs. Duplicates are kept;
/// since lookups take the first occurrence, supplied values shadow defaults.
pub fn merge_envs(supplied: Vec<EnvVar>, defaults: &[EnvVar]) -> Vec<EnvVar> {
    let mut out = supplied;
    out.extend(defaults.iter().cloned());
    out
}

/// Collapse an env list into a key → value map, first occurrence winning.
pub fn env_map(envs: &[EnvVar]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for e in envs {
        map.entry(e.key.clone()).or_insert_with(|| e.value.clone());
    }
    map
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub repository: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    #[serde(default = "default_context")]
    pub context: String,
    #[serde(default)]
    pub args: Vec<EnvVar>,
}

fn default_dockerfile() -> String { "Dockerfile".to_string() }
fn default_context() -> String { ".".to_string() }

impl Default for BuildPlan {
    fn default() -> Self {
        Self { dockerfile: default_dockerfile(), context: default_context(), args: Vec::new() }
    }
}

/// Denormalized copy of a cluster resource the platform created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    pub name: String,
    pub mount_path: String,
    pub claim_name: String,
}

/// Back-references to provisioned resources, filled in phase by phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRefs {
    pub config_map: Option<ResourceRecord>,
    pub volume_claim: Option<ResourceRecord>,
    pub volume: Option<VolumeDescriptor>,
    pub deployment: Option<ResourceRecord>,
    pub service: Option<ResourceRecord>,
    pub ingress_route: Option<ResourceRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: AppId,
    pub name: String,
    pub owner: String,
    pub kind: AppKind,
    pub visibility: Visibility,
    pub dns_name: Option<String>,
    /// Template code for template-provisioned applications.
    pub template: Option<String>,
    pub source: Option<SourceRef>,
    pub last_commit: Option<String>,
    pub build_plan: Option<BuildPlan>,
    pub image: Option<String>,
    pub port: u16,
    pub envs: Vec<EnvVar>,
    pub resources: ResourceRefs,
    pub state: AppState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Application {
    /// A not-yet-persisted application in `Created`.
    pub fn draft(name: impl Into<String>, owner: impl Into<String>, kind: AppKind) -> Self {
        let now = Utc::now();
        Self {
            id: AppId::nil(),
            name: name.into(),
            owner: owner.into(),
            kind,
            visibility: Visibility::Private,
            dns_name: None,
            template: None,
            source: None,
            last_commit: None,
            build_plan: None,
            image: None,
            port: 8080,
            envs: Vec::new(),
            resources: ResourceRefs::default(),
            state: AppState::Created,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: AppState) -> Result<(), PlatformError> {
        if !self.state.can_transition_to(next) {
            return Err(PlatformError::InvalidState {
                app: self.name.clone(),
                state: self.state,
                op: format!("transition to {}", next),
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Failed is reachable from every in-flight state; used on fatal errors
    /// where the edge has already been validated by the flow that owns it.
    pub fn mark_failed(&mut self) {
        self.state = AppState::Failed;
        self.updated_at = Utc::now();
    }
}

/// Admin-curated blueprint for a pre-built application kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub kind: AppKind,
    pub image: String,
    pub port: u16,
    #[serde(default)]
    pub required_envs: Vec<String>,
    #[serde(default)]
    pub optional_envs: Vec<String>,
    #[serde(default)]
    pub default_envs: Vec<EnvVar>,
    /// Mount path for storage-kind templates.
    #[serde(default)]
    pub persistence_path: Option<String>,
    #[serde(default)]
    pub volume_size: Option<String>,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool { true }

impl Template {
    /// Required keys not present in `supplied`, in template order.
    pub fn missing_required(&self, supplied: &[EnvVar]) -> Vec<String> {
        self.required_envs
            .iter()
            .filter(|k| env_lookup(supplied, k).is_none())
            .cloned()
            .collect()
    }
}

pub mod prelude {
    pub use super::{
        AppId, AppKind, AppState, Application, BuildPlan, EnvVar, ResourceRecord, ResourceRefs, SourceRef, Template,
        Visibility, VolumeDescriptor,
    };
    pub use super::error::{ErrorKind, PlatformError};
}
