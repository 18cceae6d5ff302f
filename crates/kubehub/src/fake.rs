//! In-process cluster that records every call, for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tokio::sync::mpsc;

use crate::{ClusterClient, ClusterError, IngressRoute, ResourceKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    Create(ResourceKind, String),
    Delete(ResourceKind, String),
    Watch(String),
}

/// Scripted outcome of `watch_deployment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// One update with `Available=True`, then the subscription closes.
    Ready,
    /// The subscription closes without any update.
    Closed,
    /// One update with `Available=False`, then the subscription closes.
    Unavailable,
    /// The subscription stays open and silent.
    Hang,
}

#[derive(Default)]
struct Objects {
    calls: Vec<ClusterCall>,
    config_maps: BTreeMap<String, ConfigMap>,
    claims: BTreeMap<String, PersistentVolumeClaim>,
    deployments: BTreeMap<String, Deployment>,
    services: BTreeMap<String, Service>,
    routes: BTreeMap<String, IngressRoute>,
    fail_on: Option<ResourceKind>,
    fail_deletes: bool,
    held: Vec<mpsc::Sender<Deployment>>,
}

pub struct RecordingCluster {
    readiness: Readiness,
    inner: Mutex<Objects>,
}

impl RecordingCluster {
    pub fn new(readiness: Readiness) -> Self { Self { readiness, inner: Mutex::new(Objects::default()) } }

    /// Make creates of `kind` fail with an API error.
    pub fn fail_on(&self, kind: ResourceKind) {
        if let Ok(mut g) = self.inner.lock() {
            g.fail_on = Some(kind);
        }
    }

    /// Make every delete fail with an API error.
    pub fn fail_deletes(&self) {
        if let Ok(mut g) = self.inner.lock() {
            g.fail_deletes = true;
        }
    }

    pub fn calls(&self) -> Vec<ClusterCall> { self.inner.lock().map(|g| g.calls.clone()).unwrap_or_default() }

    /// Kinds created, in call order.
    pub fn created_kinds(&self) -> Vec<ResourceKind> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClusterCall::Create(k, _) => Some(k),
                _ => None,
            })
            .collect()
    }

    pub fn watches(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClusterCall::Watch(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    pub fn config_map(&self, name: &str) -> Option<ConfigMap> { self.inner.lock().ok()?.config_maps.get(name).cloned() }

    pub fn deployment(&self, name: &str) -> Option<Deployment> { self.inner.lock().ok()?.deployments.get(name).cloned() }

    pub fn service(&self, name: &str) -> Option<Service> { self.inner.lock().ok()?.services.get(name).cloned() }

    pub fn ingress_route(&self, name: &str) -> Option<IngressRoute> { self.inner.lock().ok()?.routes.get(name).cloned() }

    pub fn volume_claim(&self, name: &str) -> Option<PersistentVolumeClaim> { self.inner.lock().ok()?.claims.get(name).cloned() }

    fn lock(&self) -> Result<MutexGuard<'_, Objects>, ClusterError> {
        self.inner.lock().map_err(|_| ClusterError::Api("fake cluster lock poisoned".into()))
    }

    /// Record the call, apply failure injection and duplicate detection.
    fn admit(g: &mut Objects, kind: ResourceKind, name: &str, exists: bool) -> Result<(), ClusterError> {
        g.calls.push(ClusterCall::Create(kind, name.to_string()));
        if g.fail_on == Some(kind) {
            return Err(ClusterError::Api(format!("injected failure creating {} {}", kind, name)));
        }
        if exists {
            return Err(ClusterError::AlreadyExists(format!("{} {}", kind, name)));
        }
        Ok(())
    }
}

fn with_namespace(meta: &mut ObjectMeta, ns: &str) {
    if meta.namespace.is_none() {
        meta.namespace = Some(ns.to_string());
    }
}

fn deployment_update(name: &str, available: bool) -> Deployment {
    Deployment {
        metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
        status: Some(DeploymentStatus {
            conditions: Some(vec![DeploymentCondition {
                type_: "Available".into(),
                status: if available { "True".into() } else { "False".into() },
                reason: Some("MinimumReplicasAvailable".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ClusterClient for RecordingCluster {
    async fn create_config_map(&self, ns: &str, cm: &ConfigMap) -> Result<ConfigMap, ClusterError> {
        let mut g = self.lock()?;
        let name = cm.name_any();
        let exists = g.config_maps.contains_key(&name);
        Self::admit(&mut g, ResourceKind::ConfigMap, &name, exists)?;
        let mut out = cm.clone();
        with_namespace(&mut out.metadata, ns);
        g.config_maps.insert(name, out.clone());
        Ok(out)
    }

    async fn create_volume_claim(&self, ns: &str, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, ClusterError> {
        let mut g = self.lock()?;
        let name = pvc.name_any();
        let exists = g.claims.contains_key(&name);
        Self::admit(&mut g, ResourceKind::PersistentVolumeClaim, &name, exists)?;
        let mut out = pvc.clone();
        with_namespace(&mut out.metadata, ns);
        g.claims.insert(name, out.clone());
        Ok(out)
    }

    async fn create_deployment(&self, ns: &str, deployment: &Deployment) -> Result<Deployment, ClusterError> {
        let mut g = self.lock()?;
        let name = deployment.name_any();
        let exists = g.deployments.contains_key(&name);
        Self::admit(&mut g, ResourceKind::Deployment, &name, exists)?;
        let mut out = deployment.clone();
        with_namespace(&mut out.metadata, ns);
        g.deployments.insert(name, out.clone());
        Ok(out)
    }

    async fn get_deployment(&self, _ns: &str, name: &str) -> Result<Option<Deployment>, ClusterError> {
        Ok(self.lock()?.deployments.get(name).cloned())
    }

    async fn create_service(&self, ns: &str, svc: &Service) -> Result<Service, ClusterError> {
        let mut g = self.lock()?;
        let name = svc.name_any();
        let exists = g.services.contains_key(&name);
        Self::admit(&mut g, ResourceKind::Service, &name, exists)?;
        let mut out = svc.clone();
        with_namespace(&mut out.metadata, ns);
        g.services.insert(name, out.clone());
        Ok(out)
    }

    async fn create_ingress_route(&self, ns: &str, route: &IngressRoute) -> Result<IngressRoute, ClusterError> {
        let mut g = self.lock()?;
        let name = route.name_any();
        let exists = g.routes.contains_key(&name);
        Self::admit(&mut g, ResourceKind::IngressRoute, &name, exists)?;
        let mut out = route.clone();
        with_namespace(&mut out.metadata, ns);
        g.routes.insert(name, out.clone());
        Ok(out)
    }

    async fn delete(&self, kind: ResourceKind, _ns: &str, name: &str) -> Result<(), ClusterError> {
        let mut g = self.lock()?;
        g.calls.push(ClusterCall::Delete(kind, name.to_string()));
        if g.fail_deletes {
            return Err(ClusterError::Api(format!("injected failure deleting {} {}", kind, name)));
        }
        let removed = match kind {
            ResourceKind::ConfigMap => g.config_maps.remove(name).is_some(),
            ResourceKind::PersistentVolumeClaim => g.claims.remove(name).is_some(),
            ResourceKind::Deployment => g.deployments.remove(name).is_some(),
            ResourceKind::Service => g.services.remove(name).is_some(),
            ResourceKind::IngressRoute => g.routes.remove(name).is_some(),
        };
        if removed {
            Ok(())
        } else {
            Err(ClusterError::NotFound(format!("{} {}", kind, name)))
        }
    }

    async fn watch_deployment(&self, _ns: &str, name: &str, _timeout: Duration) -> Result<mpsc::Receiver<Deployment>, ClusterError> {
        let (tx, rx) = mpsc::channel(4);
        let mut g = self.lock()?;
        g.calls.push(ClusterCall::Watch(name.to_string()));
        match self.readiness {
            Readiness::Ready => {
                let _ = tx.try_send(deployment_update(name, true));
            }
            Readiness::Unavailable => {
                let _ = tx.try_send(deployment_update(name, false));
            }
            Readiness::Closed => {}
            Readiness::Hang => g.held.push(tx),
        }
        Ok(rx)
    }
}
