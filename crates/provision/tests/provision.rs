use std::sync::Arc;
use std::time::Duration;

use skiff_core::labels;
use skiff_core::prelude::*;
use skiff_core::PlatformConfig;
use skiff_kubehub::fake::{ClusterCall, Readiness, RecordingCluster};
use skiff_kubehub::ResourceKind;
use skiff_provision::ResourceProvisioner;
use skiff_store::{MemoryStore, ResourceStore};
use tokio_util::sync::CancellationToken;

fn postgres() -> Template {
    Template {
        code: "postgres".into(),
        description: "PostgreSQL".into(),
        kind: AppKind::Storage,
        image: "postgres:16".into(),
        port: 5432,
        required_envs: vec!["POSTGRES_PASSWORD".into()],
        optional_envs: vec!["POSTGRES_USER".into()],
        default_envs: vec![EnvVar::new("PGDATA", "/var/lib/postgresql/data/pgdata"), EnvVar::new("POSTGRES_USER", "postgres")],
        persistence_path: Some("/var/lib/postgresql/data".into()),
        volume_size: None,
        available: true,
    }
}

fn adminer() -> Template {
    Template {
        code: "adminer".into(),
        description: String::new(),
        kind: AppKind::Management,
        image: "adminer:4".into(),
        port: 8080,
        required_envs: vec![],
        optional_envs: vec![],
        default_envs: vec![],
        persistence_path: None,
        volume_size: None,
        available: true,
    }
}

struct Harness {
    cluster: Arc<RecordingCluster>,
    store: Arc<MemoryStore>,
    prov: ResourceProvisioner,
}

fn harness(readiness: Readiness) -> Harness {
    let cluster = Arc::new(RecordingCluster::new(readiness));
    let store = Arc::new(MemoryStore::new());
    let prov = ResourceProvisioner::new(cluster.clone(), store.clone(), PlatformConfig::default());
    Harness { cluster, store, prov }
}

fn stem(app: &Application) -> String { labels::resource_stem(app) }

fn pg_envs() -> Vec<EnvVar> {
    vec![EnvVar::new("POSTGRES_PASSWORD", "hunter2"), EnvVar::new("POSTGRES_USER", "app")]
}

#[tokio::test]
async fn storage_flow_creates_in_order_and_stays_private() {
    let h = harness(Readiness::Ready);
    let app = h
        .prov
        .provision(&postgres(), Application::draft("pg", "", AppKind::Storage), "u1", pg_envs(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        h.cluster.created_kinds(),
        vec![ResourceKind::ConfigMap, ResourceKind::PersistentVolumeClaim, ResourceKind::Deployment, ResourceKind::Service]
    );
    assert_eq!(app.state, AppState::Running);
    assert_eq!(app.visibility, Visibility::Private);
    assert_eq!(app.dns_name.as_deref(), Some("pg"));
    assert!(app.resources.ingress_route.is_none());
    assert_eq!(app.resources.service.as_ref().unwrap().name, stem(&app));
    let vol = app.resources.volume.as_ref().unwrap();
    assert_eq!(vol.claim_name, format!("{}-data", stem(&app)));
    assert_eq!(vol.mount_path, "/var/lib/postgresql/data");

    let stored = h.store.find_by_id(app.id).await.unwrap();
    assert_eq!(stored.state, AppState::Running);
    assert_eq!(stored.owner, "u1");
}

#[tokio::test]
async fn config_map_carries_merged_envs_and_provenance_labels() {
    let h = harness(Readiness::Ready);
    let app = h
        .prov
        .provision(&postgres(), Application::draft("pg", "", AppKind::Storage), "u1", pg_envs(), &CancellationToken::new())
        .await
        .unwrap();

    let cm_name = labels::config_map_name(&stem(&app));
    let cm = h.cluster.config_map(&cm_name).unwrap();
    let data = cm.data.unwrap();
    assert_eq!(data.get("POSTGRES_USER").map(String::as_str), Some("app"), "supplied value shadows default");
    assert_eq!(data.get("PGDATA").map(String::as_str), Some("/var/lib/postgresql/data/pgdata"));

    let l = cm.metadata.labels.unwrap();
    assert_eq!(l.get(labels::OWNER).map(String::as_str), Some("u1"));
    assert_eq!(l.get(labels::MANAGED).map(String::as_str), Some("true"));
    assert_eq!(l.get(labels::RESOURCE_NAME), Some(&cm_name));
    assert_eq!(l.get(labels::APP_ID), Some(&app.id.to_string()));

    let dep = h.cluster.deployment(&stem(&app)).unwrap();
    let dl = dep.metadata.labels.unwrap();
    assert_eq!(dl.get(labels::VISIBILITY).map(String::as_str), Some("private"));
    assert_eq!(dl.get(labels::PORT).map(String::as_str), Some("5432"));

    let svc = h.cluster.service(&stem(&app)).unwrap();
    assert_eq!(svc.spec.unwrap().selector, Some(labels::app_selector(&app)));
}

#[tokio::test]
async fn management_flow_routes_public_host() {
    let h = harness(Readiness::Ready);
    let app = h
        .prov
        .provision(&adminer(), Application::draft("adm", "", AppKind::Management), "u1", vec![], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        h.cluster.created_kinds(),
        vec![ResourceKind::ConfigMap, ResourceKind::Deployment, ResourceKind::Service, ResourceKind::IngressRoute]
    );
    assert_eq!(app.visibility, Visibility::Public);
    assert_eq!(app.dns_name.as_deref(), Some("adm.apps.localhost"));
    let route = h.cluster.ingress_route(&labels::ingress_route_name(&stem(&app))).unwrap();
    assert_eq!(route.data["spec"]["routes"][0]["match"], "Host(`adm.apps.localhost`)");
    assert_eq!(route.data["spec"]["routes"][0]["services"][0]["name"], stem(&app));
    assert_eq!(app.state, AppState::Running);
}

#[tokio::test]
async fn readiness_timeout_fails_app_but_still_creates_service() {
    let h = harness(Readiness::Closed);
    let app = h
        .prov
        .provision(&postgres(), Application::draft("pg", "", AppKind::Storage), "u1", pg_envs(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(app.state, AppState::Failed);
    assert!(h.cluster.created_kinds().contains(&ResourceKind::Service));
    assert!(app.resources.service.is_none());
    assert!(app.resources.deployment.is_some());
    assert_eq!(h.store.find_by_id(app.id).await.unwrap().state, AppState::Failed);
}

#[tokio::test]
async fn management_name_is_unique_system_wide() {
    let h = harness(Readiness::Ready);
    h.store.insert(Application::draft("alpha", "someone-else", AppKind::Management)).await.unwrap();
    let before = h.store.mutations();

    let err = h
        .prov
        .provision(&adminer(), Application::draft("alpha", "", AppKind::Management), "u1", vec![], &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PlatformError::NameNotAvailable(ref n) if n == "alpha"));
    assert!(h.cluster.calls().is_empty());
    assert_eq!(h.store.mutations(), before);
}

#[tokio::test]
async fn storage_name_is_unique_per_owner() {
    let h = harness(Readiness::Ready);
    let first = h
        .prov
        .provision(&postgres(), Application::draft("alpha", "", AppKind::Storage), "u1", pg_envs(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.state, AppState::Running);
    let calls_before = h.cluster.calls().len();

    let err = h
        .prov
        .provision(&postgres(), Application::draft("alpha", "", AppKind::Storage), "u1", pg_envs(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PlatformError::NameNotAvailable(_)));
    assert_eq!(h.cluster.calls().len(), calls_before);

    // same name, different owner: both live side by side in the namespace
    let other = h
        .prov
        .provision(&postgres(), Application::draft("alpha", "", AppKind::Storage), "u2", pg_envs(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(other.owner, "u2");
    assert_eq!(other.state, AppState::Running);
    assert_eq!(other.dns_name.as_deref(), Some("alpha"));
    assert_ne!(stem(&first), stem(&other));
    assert!(h.cluster.deployment(&stem(&first)).is_some());
    assert!(h.cluster.deployment(&stem(&other)).is_some());
    assert_eq!(h.store.find_by_id(first.id).await.unwrap().state, AppState::Running);

    let first_svc = h.cluster.service(&stem(&first)).unwrap().spec.unwrap().selector.unwrap();
    let other_svc = h.cluster.service(&stem(&other)).unwrap().spec.unwrap().selector.unwrap();
    assert_ne!(first_svc, other_svc);
}

#[tokio::test]
async fn storage_app_can_share_a_name_with_another_owners_management_app() {
    let h = harness(Readiness::Ready);
    h.prov
        .provision(&adminer(), Application::draft("alpha", "", AppKind::Management), "u1", vec![], &CancellationToken::new())
        .await
        .unwrap();
    let pg = h
        .prov
        .provision(&postgres(), Application::draft("alpha", "", AppKind::Storage), "u2", pg_envs(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(pg.state, AppState::Running);
}

#[tokio::test]
async fn missing_required_env_creates_nothing() {
    let h = harness(Readiness::Ready);
    let err = h
        .prov
        .provision(&postgres(), Application::draft("pg", "", AppKind::Storage), "u1", vec![], &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PlatformError::MissingRequiredEnv { ref keys } if keys == &vec!["POSTGRES_PASSWORD".to_string()]));
    assert!(h.cluster.calls().is_empty());
    assert_eq!(h.store.mutations(), 0);
}

#[tokio::test]
async fn web_template_is_unsupported_without_side_effects() {
    let h = harness(Readiness::Ready);
    let mut t = adminer();
    t.kind = AppKind::Web;
    let err = h
        .prov
        .provision(&t, Application::draft("w", "", AppKind::Web), "u1", vec![], &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PlatformError::UnsupportedApplicationKind(_)));
    assert!(err.is_validation());
    assert!(h.cluster.calls().is_empty());
    assert_eq!(h.store.mutations(), 0);
}

#[tokio::test]
async fn invalid_name_is_rejected() {
    let h = harness(Readiness::Ready);
    let err = h
        .prov
        .provision(&adminer(), Application::draft("Bad_Name", "", AppKind::Management), "u1", vec![], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PlatformError::InvalidName { .. }));
    assert_eq!(h.store.mutations(), 0);
}

#[tokio::test]
async fn cancellation_unblocks_wait_and_leaves_record_starting() {
    let h = harness(Readiness::Hang);
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    });

    let res = tokio::time::timeout(
        Duration::from_secs(5),
        h.prov.provision(&adminer(), Application::draft("adm", "", AppKind::Management), "u1", vec![], &cancel),
    )
    .await
    .expect("cancellation must unblock the readiness wait");

    assert!(matches!(res, Err(PlatformError::Cancelled(_))));
    assert!(!h.cluster.created_kinds().contains(&ResourceKind::Service));
    let stored = h.store.find_by_name("adm").await.unwrap();
    assert_eq!(stored.state, AppState::Starting);
    assert!(stored.resources.deployment.is_some());
}

#[tokio::test]
async fn cluster_failure_mid_flow_marks_failed() {
    let h = harness(Readiness::Ready);
    h.cluster.fail_on(ResourceKind::Deployment);
    let err = h
        .prov
        .provision(&postgres(), Application::draft("pg", "", AppKind::Storage), "u1", pg_envs(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PlatformError::Cluster(_)));
    // no rollback of what was already created
    assert_eq!(
        h.cluster.created_kinds(),
        vec![ResourceKind::ConfigMap, ResourceKind::PersistentVolumeClaim, ResourceKind::Deployment]
    );
    assert_eq!(h.store.find_by_name("pg").await.unwrap().state, AppState::Failed);
}

async fn building_app(store: &MemoryStore, name: &str, visibility: Visibility) -> Application {
    let mut app = Application::draft(name, "u1", AppKind::Web);
    app.visibility = visibility;
    app.state = AppState::Building;
    store.insert(app).await.unwrap()
}

#[tokio::test]
async fn deploy_build_runs_web_flow() {
    let h = harness(Readiness::Ready);
    let private = building_app(&h.store, "api", Visibility::Private).await;
    let app = h
        .prov
        .deploy_build(private.id, "registry.local/u1/api:abc123", Some("abc123"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(app.state, AppState::Running);
    assert_eq!(app.image.as_deref(), Some("registry.local/u1/api:abc123"));
    assert_eq!(app.last_commit.as_deref(), Some("abc123"));
    assert!(!h.cluster.created_kinds().contains(&ResourceKind::IngressRoute));

    let public = building_app(&h.store, "site", Visibility::Public).await;
    let app = h.prov.deploy_build(public.id, "registry.local/u1/site:1", None, &CancellationToken::new()).await.unwrap();
    assert_eq!(app.dns_name.as_deref(), Some("site.apps.localhost"));
    assert!(h.cluster.ingress_route(&labels::ingress_route_name(&stem(&app))).is_some());
}

#[tokio::test]
async fn redeploy_replaces_previous_workload() {
    let h = harness(Readiness::Ready);
    let app = building_app(&h.store, "api", Visibility::Private).await;
    let app = h.prov.deploy_build(app.id, "img:1", None, &CancellationToken::new()).await.unwrap();

    let mut updating = app.clone();
    updating.transition(AppState::Updating).unwrap();
    h.store.update_by_id(updating.id, &updating).await.unwrap();

    let app = h.prov.deploy_build(app.id, "img:2", None, &CancellationToken::new()).await.unwrap();
    assert_eq!(app.state, AppState::Running);
    assert!(h.cluster.calls().contains(&ClusterCall::Delete(ResourceKind::Deployment, stem(&app))));
    let dep = h.cluster.deployment(&stem(&app)).unwrap();
    let image = dep.spec.unwrap().template.spec.unwrap().containers[0].image.clone();
    assert_eq!(image.as_deref(), Some("img:2"));
}

#[tokio::test]
async fn redeploy_delete_failure_marks_failed() {
    let h = harness(Readiness::Ready);
    let app = building_app(&h.store, "api", Visibility::Private).await;
    let app = h.prov.deploy_build(app.id, "img:1", None, &CancellationToken::new()).await.unwrap();

    let mut updating = app.clone();
    updating.transition(AppState::Updating).unwrap();
    h.store.update_by_id(updating.id, &updating).await.unwrap();
    h.cluster.fail_deletes();

    let err = h.prov.deploy_build(app.id, "img:2", None, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, PlatformError::Cluster(_)));
    let stored = h.store.find_by_id(app.id).await.unwrap();
    assert_eq!(stored.state, AppState::Failed);
    assert!(stored.state.can_request_build());
}

#[tokio::test]
async fn deploy_build_requires_build_in_flight() {
    let h = harness(Readiness::Ready);
    let app = h.store.insert(Application::draft("api", "u1", AppKind::Web)).await.unwrap();
    let err = h.prov.deploy_build(app.id, "img", None, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, PlatformError::InvalidState { .. }));
    assert!(h.cluster.calls().is_empty());
}

#[tokio::test]
async fn teardown_deletes_newest_first_and_keeps_record() {
    let h = harness(Readiness::Ready);
    let app = h
        .prov
        .provision(&postgres(), Application::draft("pg", "", AppKind::Storage), "u1", pg_envs(), &CancellationToken::new())
        .await
        .unwrap();

    let removed = h.prov.teardown(app.id).await.unwrap();
    let kinds: Vec<_> = removed.iter().map(|(k, _)| *k).collect();
    assert_eq!(
        kinds,
        vec![ResourceKind::Service, ResourceKind::Deployment, ResourceKind::ConfigMap, ResourceKind::PersistentVolumeClaim]
    );
    let stored = h.store.find_by_id(app.id).await.unwrap();
    assert_eq!(stored.resources, ResourceRefs::default());
    assert_eq!(stored.state, AppState::Failed);
    assert!(stored.dns_name.is_none());
    assert!(h.cluster.deployment(&stem(&app)).is_none());
}
