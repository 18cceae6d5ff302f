//! Skiff provisioning: drives an application through ConfigMap, optional claim,
//! Deployment, readiness, Service and optional IngressRoute, reconciling the
//! persisted record with each outcome.

#![forbid(unsafe_code)]

pub mod flow;

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use skiff_core::labels::{self, LabelSet};
use skiff_core::{
    env_map, merge_envs, AppId, AppState, Application, EnvVar, PlatformConfig, PlatformError, ResourceRefs, Template,
    Visibility, VolumeDescriptor,
};
use skiff_kubehub::manifests::{self, Route, Workload};
use skiff_kubehub::{ClusterClient, ClusterError, ReadinessError, ReadinessWatcher, ResourceKind};
use skiff_store::{optional, ResourceStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use flow::{Exposure, Flow, NameScope, StorageFlow};

pub struct ResourceProvisioner {
    cluster: Arc<dyn ClusterClient>,
    store: Arc<dyn ResourceStore>,
    readiness: ReadinessWatcher,
    cfg: PlatformConfig,
}

impl ResourceProvisioner {
    pub fn new(cluster: Arc<dyn ClusterClient>, store: Arc<dyn ResourceStore>, cfg: PlatformConfig) -> Self {
        let readiness = ReadinessWatcher::new(Arc::clone(&cluster));
        Self { cluster, store, readiness, cfg }
    }

    pub fn config(&self) -> &PlatformConfig { &self.cfg }

    /// Provision a template application. Validation happens before any side
    /// effect; a readiness timeout yields `Ok` with the record in `Failed`.
    pub async fn provision(
        &self,
        template: &Template,
        mut app: Application,
        owner: &str,
        envs: Vec<EnvVar>,
        cancel: &CancellationToken,
    ) -> Result<Application, PlatformError> {
        let flow = Flow::select(template, &self.cfg)?;
        labels::validate_app_name(&app.name)?;
        let missing = template.missing_required(&envs);
        if !missing.is_empty() {
            return Err(PlatformError::MissingRequiredEnv { keys: missing });
        }
        self.ensure_name_available(&flow, &app.name, owner).await?;

        counter!("provision_attempts", 1u64);
        app.owner = owner.to_string();
        app.kind = template.kind;
        app.template = Some(template.code.clone());
        app.image = Some(template.image.clone());
        app.port = template.port;
        app.envs = merge_envs(envs, &template.default_envs);
        app.state = AppState::Created;
        app.resources = ResourceRefs::default();
        let mut app = self.store.insert(app).await?;
        info!(app = %app.name, app_id = %app.id, owner = %owner, template = %template.code, "provision: accepted");

        app.transition(AppState::Starting)?;
        self.run(&flow, app, cancel).await
    }

    /// Deploy a freshly built image for an application whose build is in flight.
    pub async fn deploy_build(
        &self,
        app_id: AppId,
        image: &str,
        commit: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Application, PlatformError> {
        let mut app = self.store.find_by_id(app_id).await?;
        if !app.state.is_build_in_flight() {
            return Err(PlatformError::InvalidState { app: app.name.clone(), state: app.state, op: "deploy build".into() });
        }
        counter!("provision_attempts", 1u64);
        app.image = Some(image.to_string());
        if let Some(c) = commit {
            app.last_commit = Some(c.to_string());
        }
        if app.resources != ResourceRefs::default() {
            if let Err(e) = self.remove_workload(&app).await {
                return self.fail(app, e.into()).await;
            }
            app.resources = ResourceRefs::default();
        }
        app.transition(AppState::Starting)?;
        info!(app = %app.name, app_id = %app.id, image = %image, "provision: deploying build");
        let flow = Flow::for_build(app.visibility, &self.cfg);
        self.run(&flow, app, cancel).await
    }

    /// Delete every resource the application may own, newest first. Missing
    /// resources are skipped. The record is kept in `Failed` with its
    /// back-references cleared, so a new build can be requested for it.
    pub async fn teardown(&self, app_id: AppId) -> Result<Vec<(ResourceKind, String)>, PlatformError> {
        let mut app = self.store.find_by_id(app_id).await?;
        let mut removed = self.remove_workload(&app).await?;
        let claim = labels::volume_claim_name(&labels::resource_stem(&app));
        if delete_if_present(self.cluster.as_ref(), ResourceKind::PersistentVolumeClaim, &self.cfg.namespace, &claim).await? {
            removed.push((ResourceKind::PersistentVolumeClaim, claim));
        }
        app.resources = ResourceRefs::default();
        app.dns_name = None;
        app.mark_failed();
        self.store.update_by_id(app.id, &app).await?;
        info!(app = %app.name, app_id = %app.id, removed = removed.len(), "teardown: done");
        Ok(removed)
    }

    async fn ensure_name_available(&self, flow: &Flow, name: &str, owner: &str) -> Result<(), PlatformError> {
        let existing = match flow.name_scope() {
            NameScope::SystemWide => optional(self.store.find_by_name(name).await)?,
            NameScope::Owner => optional(self.store.find_by_name_and_owner(name, owner).await)?,
        };
        match existing {
            Some(_) => Err(PlatformError::NameNotAvailable(name.to_string())),
            None => Ok(()),
        }
    }

    /// Everything except the claim, which outlives redeploys.
    async fn remove_workload(&self, app: &Application) -> Result<Vec<(ResourceKind, String)>, ClusterError> {
        let ns = &self.cfg.namespace;
        let stem = labels::resource_stem(app);
        let mut removed = Vec::new();
        for (kind, name) in [
            (ResourceKind::IngressRoute, labels::ingress_route_name(&stem)),
            (ResourceKind::Service, labels::service_name(&stem)),
            (ResourceKind::Deployment, labels::deployment_name(&stem)),
            (ResourceKind::ConfigMap, labels::config_map_name(&stem)),
        ] {
            if delete_if_present(self.cluster.as_ref(), kind, ns, &name).await? {
                debug!(app = %app.name, kind = %kind, name = %name, "removed");
                removed.push((kind, name));
            }
        }
        Ok(removed)
    }

    /// Ordered resource pipeline shared by template and build flows. Expects
    /// the record persisted and in `Starting`.
    async fn run(&self, flow: &Flow, mut app: Application, cancel: &CancellationToken) -> Result<Application, PlatformError> {
        let started = Instant::now();
        let ns = self.cfg.namespace.clone();
        let stem = labels::resource_stem(&app);

        let cm_name = labels::config_map_name(&stem);
        let cm = manifests::config_map(&ns, &cm_name, &self.labels_for(&app, &cm_name).into_map(), env_map(&app.envs));
        let cm = match self.cluster.create_config_map(&ns, &cm).await {
            Ok(cm) => cm,
            Err(e) => return self.fail(app, e.into()).await,
        };
        app.resources.config_map = Some(manifests::record(&cm.metadata, &ns));
        info!(app = %app.name, config_map = %cm_name, "provision: config map created");

        let mut volume = None;
        if let Some(storage) = flow.storage() {
            let claim_name = labels::volume_claim_name(&stem);
            let pvc = manifests::volume_claim(
                &ns,
                &claim_name,
                &self.labels_for(&app, &claim_name).into_map(),
                &storage.storage_class,
                &storage.volume_size,
            );
            let pvc = match self.cluster.create_volume_claim(&ns, &pvc).await {
                Ok(pvc) => pvc,
                Err(e) => return self.fail(app, e.into()).await,
            };
            app.resources.volume_claim = Some(manifests::record(&pvc.metadata, &ns));
            let v = VolumeDescriptor {
                name: labels::volume_name(&stem),
                mount_path: storage.mount_path.clone(),
                claim_name: claim_name.clone(),
            };
            app.resources.volume = Some(v.clone());
            volume = Some(v);
            info!(app = %app.name, claim = %claim_name, size = %storage.volume_size, "provision: volume claim created");
        }

        let visibility = flow.visibility();
        let dep_name = labels::deployment_name(&stem);
        let dep_labels = self.labels_for(&app, &dep_name)
            .with(labels::VISIBILITY, visibility.as_str())
            .with(labels::PORT, &app.port.to_string())
            .into_map();
        let selector = labels::app_selector(&app);
        let image = app.image.clone().unwrap_or_default();
        let dep = manifests::deployment(
            &ns,
            &Workload {
                name: &dep_name,
                image: &image,
                port: app.port,
                config_map: &cm_name,
                volume: volume.as_ref(),
                labels: &dep_labels,
                selector: &selector,
            },
        );
        let dep = match self.cluster.create_deployment(&ns, &dep).await {
            Ok(d) => d,
            Err(e) => return self.fail(app, e.into()).await,
        };
        app.resources.deployment = Some(manifests::record(&dep.metadata, &ns));
        if let Err(e) = self.store.update_by_id(app.id, &app).await {
            return self.fail(app, e.into()).await;
        }
        info!(app = %app.name, deployment = %dep_name, "provision: deployment created; waiting for readiness");

        let wait = self.readiness.wait_ready(&ns, &dep_name, self.cfg.readiness_timeout, cancel.child_token());
        let ready = tokio::select! {
            r = wait => r,
            _ = cancel.cancelled() => Err(ReadinessError::Cancelled(dep_name.clone())),
        };
        let ready = match ready {
            Ok(()) => true,
            Err(ReadinessError::Cancelled(_)) => {
                warn!(app = %app.name, app_id = %app.id, state = %app.state, "provision: readiness wait cancelled; record left as is");
                return Err(PlatformError::Cancelled(format!("readiness wait for {}", dep_name)));
            }
            Err(e) => {
                error!(
                    app = %app.name,
                    app_id = %app.id,
                    error = %e,
                    "provision: deployment never became available; check cluster capacity and quotas"
                );
                false
            }
        };

        // Created regardless of readiness; only the back-reference depends on it.
        let svc_name = labels::service_name(&stem);
        let svc = manifests::service(&ns, &svc_name, &self.labels_for(&app, &svc_name).into_map(), &selector, app.port);
        let svc = match self.cluster.create_service(&ns, &svc).await {
            Ok(s) => s,
            Err(e) => return self.fail(app, e.into()).await,
        };
        if ready {
            app.resources.service = Some(manifests::record(&svc.metadata, &ns));
        }
        info!(app = %app.name, service = %svc_name, "provision: service created");

        match flow.exposure() {
            Some(exposure) => {
                let route_name = labels::ingress_route_name(&stem);
                let host = labels::public_host(&app.name, &exposure.base_domain);
                let route = manifests::ingress_route(
                    &ns,
                    &Route {
                        name: &route_name,
                        host: &host,
                        service: &svc_name,
                        port: app.port,
                        entrypoint: &exposure.entrypoint,
                        tls_resolver: exposure.tls_resolver.as_deref(),
                        labels: &self.labels_for(&app, &route_name).into_map(),
                    },
                );
                let route = match self.cluster.create_ingress_route(&ns, &route).await {
                    Ok(r) => r,
                    Err(e) => return self.fail(app, e.into()).await,
                };
                app.resources.ingress_route = Some(manifests::record(&route.metadata, &ns));
                app.dns_name = Some(host.clone());
                app.visibility = Visibility::Public;
                info!(app = %app.name, host = %host, "provision: ingress route created");
            }
            None => {
                app.dns_name = Some(app.name.clone());
                app.visibility = Visibility::Private;
            }
        }

        if ready {
            app.transition(AppState::Running)?;
            counter!("provision_ok", 1u64);
        } else {
            app.mark_failed();
            counter!("provision_failed", 1u64);
        }
        self.store.update_by_id(app.id, &app).await?;
        histogram!("provision_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(app = %app.name, app_id = %app.id, state = %app.state, took_ms = started.elapsed().as_millis() as u64, "provision: finished");
        Ok(app)
    }

    fn labels_for(&self, app: &Application, resource: &str) -> LabelSet {
        LabelSet::standard(&self.cfg, &app.owner, resource).with_app(app)
    }

    /// Mark the record failed, then return the error that stopped the flow.
    async fn fail(&self, mut app: Application, e: PlatformError) -> Result<Application, PlatformError> {
        counter!("provision_failed", 1u64);
        error!(app = %app.name, app_id = %app.id, error = %e, "provision: flow aborted");
        app.mark_failed();
        if let Err(se) = self.store.update_by_id(app.id, &app).await {
            warn!(app = %app.name, app_id = %app.id, error = %se, "provision: could not persist failed state");
        }
        Err(e)
    }
}

async fn delete_if_present(cluster: &dyn ClusterClient, kind: ResourceKind, ns: &str, name: &str) -> Result<bool, ClusterError> {
    match cluster.delete(kind, ns, name).await {
        Ok(()) => Ok(true),
        Err(ClusterError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}
