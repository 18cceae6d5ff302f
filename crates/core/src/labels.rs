//! Provenance labels and deterministic resource names.
//!
//! Every resource the platform creates carries the standard label set; the
//! `app-name` and `app-id` labels double as the pod selector for Services. Resource names are
//! derived from a per-application stem (`<name>-<id8>`), so storage apps that
//! share a name under different owners never collide in the namespace.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{Application, PlatformConfig, PlatformError};

pub const OWNER: &str = "skiff.dev/owner";
pub const ENVIRONMENT: &str = "skiff.dev/environment";
pub const PLATFORM_VERSION: &str = "skiff.dev/platform-version";
pub const MANAGED: &str = "skiff.dev/managed";
pub const RESOURCE_NAME: &str = "skiff.dev/resource-name";
pub const APP_NAME: &str = "skiff.dev/app-name";
pub const APP_ID: &str = "skiff.dev/app-id";
pub const VISIBILITY: &str = "skiff.dev/visibility";
pub const PORT: &str = "skiff.dev/port";

/// Standard `app.kubernetes.io/managed-by` label.
pub const K8S_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_SKIFF: &str = "skiff";

/// Application names must leave room for the id suffix and the longest derived suffix.
pub const MAX_APP_NAME_LEN: usize = 40;

static DNS_LABEL: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[a-z]([-a-z0-9]*[a-z0-9])?$").ok());

fn is_dns_label(name: &str) -> bool {
    match DNS_LABEL.as_ref() {
        Some(re) => re.is_match(name),
        None => name.starts_with(|c: char| c.is_ascii_lowercase())
            && name.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
            && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    /// owner, environment, platform-version, managed=true, resource-name.
    pub fn standard(cfg: &PlatformConfig, owner: &str, resource_name: &str) -> Self {
        let mut m = BTreeMap::new();
        m.insert(OWNER.to_string(), sanitize_value(owner));
        m.insert(ENVIRONMENT.to_string(), sanitize_value(&cfg.environment));
        m.insert(PLATFORM_VERSION.to_string(), sanitize_value(&cfg.platform_version));
        m.insert(MANAGED.to_string(), "true".to_string());
        m.insert(RESOURCE_NAME.to_string(), sanitize_value(resource_name));
        m.insert(K8S_MANAGED_BY.to_string(), MANAGED_BY_SKIFF.to_string());
        Self(m)
    }

    /// Adds app-name and, once the record is persisted, app-id.
    pub fn with_app(mut self, app: &Application) -> Self {
        self.0.insert(APP_NAME.to_string(), sanitize_value(&app.name));
        if !app.id.is_nil() {
            self.0.insert(APP_ID.to_string(), app.id.to_string());
        }
        self
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), sanitize_value(value));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> { self.0.get(key).map(String::as_str) }

    pub fn into_map(self) -> BTreeMap<String, String> { self.0 }
}

/// Pod selector shared by a Deployment and its Service. The id keeps
/// same-named applications of different owners apart.
pub fn app_selector(app: &Application) -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    m.insert(APP_NAME.to_string(), sanitize_value(&app.name));
    m.insert(APP_ID.to_string(), app.id.to_string());
    m
}

/// Render a label map as a `k=v,k2=v2` selector string.
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Coerce into a valid label value: `[A-Za-z0-9._-]`, alphanumeric at both ends, at most 63 chars.
pub fn sanitize_value(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '-' })
        .take(63)
        .collect();
    mapped.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
}

pub fn validate_app_name(name: &str) -> Result<(), PlatformError> {
    let reason = if name.is_empty() {
        Some("must not be empty")
    } else if name.len() > MAX_APP_NAME_LEN {
        Some("must be at most 40 characters")
    } else if !is_dns_label(name) {
        Some("must be lowercase alphanumerics or '-', start with a letter and end alphanumeric")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(PlatformError::InvalidName { name: name.to_string(), reason }),
        None => Ok(()),
    }
}

/// Base of every resource name for a persisted application.
pub fn resource_stem(app: &Application) -> String { format!("{}-{}", app.name, app.id.short()) }

pub fn config_map_name(stem: &str) -> String { format!("{}-env", stem) }
pub fn volume_claim_name(stem: &str) -> String { format!("{}-data", stem) }
pub fn volume_name(stem: &str) -> String { format!("{}-volume", stem) }
pub fn deployment_name(stem: &str) -> String { stem.to_string() }
pub fn service_name(stem: &str) -> String { stem.to_string() }
pub fn ingress_route_name(stem: &str) -> String { format!("{}-route", stem) }

pub fn public_host(app: &str, base_domain: &str) -> String { format!("{}.{}", app, base_domain) }
