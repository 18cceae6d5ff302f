//! Provisioning variants, selected once per request from the template kind.

use skiff_core::{AppKind, PlatformConfig, PlatformError, Template, Visibility};

/// Where a volume-backed workload keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageFlow {
    pub mount_path: String,
    pub storage_class: String,
    pub volume_size: String,
}

/// Public exposure through an IngressRoute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exposure {
    pub base_domain: String,
    pub entrypoint: String,
    pub tls_resolver: Option<String>,
}

impl Exposure {
    pub fn from_config(cfg: &PlatformConfig) -> Self {
        Self {
            base_domain: cfg.base_domain.clone(),
            entrypoint: cfg.ingress_entrypoint.clone(),
            tls_resolver: cfg.tls_resolver.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Private, volume-backed, never routed.
    Storage(StorageFlow),
    /// Publicly routed at `<name>.<base_domain>`.
    Management(Exposure),
    /// Built from source; routed only when the application is public.
    Web(Option<Exposure>),
}

/// Scope in which an application name must be unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameScope {
    SystemWide,
    Owner,
}

const DEFAULT_MOUNT_PATH: &str = "/data";

impl Flow {
    /// Template dispatch. Only storage and management templates are provisionable.
    pub fn select(template: &Template, cfg: &PlatformConfig) -> Result<Flow, PlatformError> {
        match template.kind {
            AppKind::Storage => Ok(Flow::Storage(StorageFlow {
                mount_path: template.persistence_path.clone().unwrap_or_else(|| DEFAULT_MOUNT_PATH.to_string()),
                storage_class: cfg.storage_class.clone(),
                volume_size: template.volume_size.clone().unwrap_or_else(|| cfg.volume_size.clone()),
            })),
            AppKind::Management => Ok(Flow::Management(Exposure::from_config(cfg))),
            other => Err(PlatformError::UnsupportedApplicationKind(other.as_str().to_string())),
        }
    }

    pub fn for_build(visibility: Visibility, cfg: &PlatformConfig) -> Flow {
        match visibility {
            Visibility::Public => Flow::Web(Some(Exposure::from_config(cfg))),
            Visibility::Private => Flow::Web(None),
        }
    }

    pub fn name_scope(&self) -> NameScope {
        match self {
            Flow::Storage(_) => NameScope::Owner,
            Flow::Management(_) | Flow::Web(_) => NameScope::SystemWide,
        }
    }

    pub fn storage(&self) -> Option<&StorageFlow> {
        match self {
            Flow::Storage(s) => Some(s),
            _ => None,
        }
    }

    pub fn exposure(&self) -> Option<&Exposure> {
        match self {
            Flow::Management(e) | Flow::Web(Some(e)) => Some(e),
            _ => None,
        }
    }

    pub fn visibility(&self) -> Visibility {
        if self.exposure().is_some() {
            Visibility::Public
        } else {
            Visibility::Private
        }
    }
}
