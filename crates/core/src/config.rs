//! Runtime configuration, read from `SKIFF_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Namespace every application resource is created in.
    pub namespace: String,
    /// Value of the `environment` label.
    pub environment: String,
    pub platform_version: String,
    /// Management-kind apps are exposed at `<name>.<base_domain>`.
    pub base_domain: String,
    pub readiness_timeout: Duration,
    pub storage_class: String,
    pub volume_size: String,
    pub ingress_entrypoint: String,
    pub tls_resolver: Option<String>,
    pub request_queue: String,
    pub response_queue: String,
    pub db_path: PathBuf,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl PlatformConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparsable values fall back to defaults.
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |k: &str, default: &str| get(k).filter(|v| !v.trim().is_empty()).unwrap_or_else(|| default.to_string());
        let readiness_secs = get("SKIFF_READINESS_TIMEOUT_SECS").and_then(|s| s.parse::<u64>().ok()).unwrap_or(300);
        Self {
            namespace: text("SKIFF_NAMESPACE", "skiff-apps"),
            environment: text("SKIFF_ENVIRONMENT", "dev"),
            platform_version: text("SKIFF_PLATFORM_VERSION", env!("CARGO_PKG_VERSION")),
            base_domain: text("SKIFF_BASE_DOMAIN", "apps.localhost").trim_start_matches('.').to_string(),
            readiness_timeout: Duration::from_secs(readiness_secs),
            storage_class: text("SKIFF_STORAGE_CLASS", "standard"),
            volume_size: text("SKIFF_VOLUME_SIZE", "1Gi"),
            ingress_entrypoint: text("SKIFF_INGRESS_ENTRYPOINT", "websecure"),
            tls_resolver: get("SKIFF_TLS_RESOLVER").filter(|v| !v.trim().is_empty()),
            request_queue: text("SKIFF_REQUEST_QUEUE", "build.request"),
            response_queue: text("SKIFF_RESPONSE_QUEUE", "build.response"),
            db_path: get("SKIFF_DB_PATH").map(PathBuf::from).unwrap_or_else(default_db_path),
        }
    }
}

fn default_db_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => {
            let mut p = PathBuf::from(home);
            p.push(".skiff");
            p.push("skiff.db");
            p
        }
        None => PathBuf::from("skiff.db"),
    }
}
