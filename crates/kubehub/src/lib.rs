//! Skiff kubehub: declarative resource creation and watch wiring against the cluster.

#![forbid(unsafe_code)]

pub mod fake;
pub mod manifests;
pub mod readiness;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, DeleteParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::watcher::{self, Event},
    Client, Resource,
};
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use skiff_core::{labels, PlatformError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use readiness::{is_available, ReadinessError, ReadinessHandle, ReadinessWatcher};

/// Traefik IngressRoute, handled as a dynamic object.
pub type IngressRoute = DynamicObject;

pub const INGRESS_ROUTE_GROUP: &str = "traefik.io";
pub const INGRESS_ROUTE_VERSION: &str = "v1alpha1";

pub fn ingress_route_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(INGRESS_ROUTE_GROUP, INGRESS_ROUTE_VERSION, "IngressRoute");
    ApiResource::from_gvk_with_plural(&gvk, "ingressroutes")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ConfigMap,
    PersistentVolumeClaim,
    Deployment,
    Service,
    IngressRoute,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Service => "Service",
            ResourceKind::IngressRoute => "IngressRoute",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("api: {0}")]
    Api(String),
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 409 => ClusterError::AlreadyExists(ae.message),
            kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(ae.message),
            other => ClusterError::Api(other.to_string()),
        }
    }
}

impl From<ClusterError> for PlatformError {
    fn from(e: ClusterError) -> Self { PlatformError::Cluster(e.to_string()) }
}

/// Namespaced create/get/delete for the resources the platform manages, plus a
/// bounded watch on a single Deployment.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn create_config_map(&self, ns: &str, cm: &ConfigMap) -> Result<ConfigMap, ClusterError>;

    async fn create_volume_claim(&self, ns: &str, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, ClusterError>;

    async fn create_deployment(&self, ns: &str, deployment: &Deployment) -> Result<Deployment, ClusterError>;

    async fn get_deployment(&self, ns: &str, name: &str) -> Result<Option<Deployment>, ClusterError>;

    async fn create_service(&self, ns: &str, svc: &Service) -> Result<Service, ClusterError>;

    async fn create_ingress_route(&self, ns: &str, route: &IngressRoute) -> Result<IngressRoute, ClusterError>;

    async fn delete(&self, kind: ResourceKind, ns: &str, name: &str) -> Result<(), ClusterError>;

    /// Stream change events for the named Deployment. The channel closes when
    /// `timeout` elapses or the underlying watch ends.
    async fn watch_deployment(&self, ns: &str, name: &str, timeout: Duration) -> Result<mpsc::Receiver<Deployment>, ClusterError>;
}

/// kube-rs backed cluster client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    async fn create<K>(&self, ns: &str, obj: &K) -> Result<K, ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + fmt::Debug + Serialize + DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), ns);
        let created = api.create(&PostParams::default(), obj).await?;
        counter!("cluster_create_total", 1u64);
        debug!(kind = %K::kind(&()), ns = %ns, name = ?created.meta().name, "cluster: created");
        Ok(created)
    }

    async fn delete_typed<K>(&self, ns: &str, name: &str) -> Result<(), ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + fmt::Debug + DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), ns);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn create_config_map(&self, ns: &str, cm: &ConfigMap) -> Result<ConfigMap, ClusterError> {
        self.create(ns, cm).await
    }

    async fn create_volume_claim(&self, ns: &str, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, ClusterError> {
        self.create(ns, pvc).await
    }

    async fn create_deployment(&self, ns: &str, deployment: &Deployment) -> Result<Deployment, ClusterError> {
        self.create(ns, deployment).await
    }

    async fn get_deployment(&self, ns: &str, name: &str) -> Result<Option<Deployment>, ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
        Ok(api.get_opt(name).await?)
    }

    async fn create_service(&self, ns: &str, svc: &Service) -> Result<Service, ClusterError> {
        self.create(ns, svc).await
    }

    async fn create_ingress_route(&self, ns: &str, route: &IngressRoute) -> Result<IngressRoute, ClusterError> {
        let ar = ingress_route_resource();
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), ns, &ar);
        let created = api.create(&PostParams::default(), route).await?;
        counter!("cluster_create_total", 1u64);
        debug!(kind = "IngressRoute", ns = %ns, name = ?created.metadata.name, "cluster: created");
        Ok(created)
    }

    async fn delete(&self, kind: ResourceKind, ns: &str, name: &str) -> Result<(), ClusterError> {
        match kind {
            ResourceKind::ConfigMap => self.delete_typed::<ConfigMap>(ns, name).await,
            ResourceKind::PersistentVolumeClaim => self.delete_typed::<PersistentVolumeClaim>(ns, name).await,
            ResourceKind::Deployment => self.delete_typed::<Deployment>(ns, name).await,
            ResourceKind::Service => self.delete_typed::<Service>(ns, name).await,
            ResourceKind::IngressRoute => {
                let ar = ingress_route_resource();
                let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), ns, &ar);
                api.delete(name, &DeleteParams::default()).await?;
                Ok(())
            }
        }
    }

    async fn watch_deployment(&self, ns: &str, name: &str, timeout: Duration) -> Result<mpsc::Receiver<Deployment>, ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
        let selector = format!("{}={}", labels::RESOURCE_NAME, labels::sanitize_value(name));
        let cfg = watcher::Config::default().labels(&selector);
        let (tx, rx) = mpsc::channel::<Deployment>(16);
        let deadline = tokio::time::Instant::now() + timeout;
        let name = name.to_string();
        let ns = ns.to_string();
        tokio::spawn(async move {
            let stream = watcher::watcher(api, cfg);
            futures::pin_mut!(stream);
            info!(deployment = %name, ns = %ns, timeout_secs = timeout.as_secs(), "watcher started");
            loop {
                let next = match tokio::time::timeout_at(deadline, stream.try_next()).await {
                    Ok(n) => n,
                    Err(_) => {
                        debug!(deployment = %name, "watch deadline reached");
                        break;
                    }
                };
                match next {
                    Ok(Some(Event::Applied(d))) => {
                        if tx.send(d).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(Event::Restarted(list))) => {
                        debug!(count = list.len(), "watch restart");
                        for d in list {
                            if tx.send(d).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Some(Event::Deleted(_))) => debug!(deployment = %name, "watched deployment deleted"),
                    Ok(None) => {
                        warn!(deployment = %name, "watcher stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!(deployment = %name, error = %e, "watcher error; closing subscription");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}
