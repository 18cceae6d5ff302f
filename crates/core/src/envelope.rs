//! Build request/response envelopes exchanged with the external builder.
//! The application id is the correlation key in both directions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppId, Application, BuildPlan, SourceRef};

/// Credentials the builder uses to pull the source repository.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCredentials {
    pub username: Option<String>,
    pub token: String,
}

impl fmt::Debug for SourceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCredentials")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub app_id: AppId,
    pub app_name: String,
    pub owner: String,
    pub source: SourceRef,
    pub credentials: SourceCredentials,
    pub plan: BuildPlan,
    pub requested_at: DateTime<Utc>,
}

impl BuildRequest {
    /// `None` when the application has no source reference to build from.
    pub fn for_application(app: &Application, credentials: SourceCredentials) -> Option<Self> {
        let source = app.source.clone()?;
        Some(Self {
            app_id: app.id,
            app_name: app.name.clone(),
            owner: app.owner.clone(),
            source,
            credentials,
            plan: app.build_plan.clone().unwrap_or_default(),
            requested_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Success,
    Failed,
}

/// Who is to blame for a failed build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildFault {
    Service,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFailure {
    pub fault: BuildFault,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResponse {
    pub app_id: AppId,
    pub status: BuildStatus,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub error: Option<BuildFailure>,
}
