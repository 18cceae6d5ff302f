//! Typed manifests for the resources an application owns.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::DynamicObject;
use serde_json::json;
use skiff_core::{ResourceRecord, VolumeDescriptor};

use crate::{ingress_route_resource, IngressRoute};

fn meta(ns: &str, name: &str, labels: &BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(ns.to_string()),
        labels: Some(labels.clone()),
        ..Default::default()
    }
}

pub fn config_map(ns: &str, name: &str, labels: &BTreeMap<String, String>, data: BTreeMap<String, String>) -> ConfigMap {
    ConfigMap { metadata: meta(ns, name, labels), data: Some(data), ..Default::default() }
}

/// Single-writer claim of `size` on `storage_class`.
pub fn volume_claim(ns: &str, name: &str, labels: &BTreeMap<String, String>, storage_class: &str, size: &str) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(size.to_string()));
    PersistentVolumeClaim {
        metadata: meta(ns, name, labels),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some(storage_class.to_string()),
            resources: Some(VolumeResourceRequirements { requests: Some(requests), ..Default::default() }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Inputs for a single-container workload.
#[derive(Debug, Clone)]
pub struct Workload<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub port: u16,
    pub config_map: &'a str,
    pub volume: Option<&'a VolumeDescriptor>,
    pub labels: &'a BTreeMap<String, String>,
    pub selector: &'a BTreeMap<String, String>,
}

pub fn deployment(ns: &str, w: &Workload<'_>) -> Deployment {
    // Pod labels must carry the selector even if the caller's label set does not.
    let mut pod_labels = w.labels.clone();
    pod_labels.extend(w.selector.iter().map(|(k, v)| (k.clone(), v.clone())));

    let container = Container {
        name: w.name.to_string(),
        image: Some(w.image.to_string()),
        ports: Some(vec![ContainerPort { container_port: i32::from(w.port), name: Some("http".into()), ..Default::default() }]),
        env_from: Some(vec![EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource { name: Some(w.config_map.to_string()), optional: None }),
            ..Default::default()
        }]),
        volume_mounts: w.volume.map(|v| {
            vec![VolumeMount { name: v.name.clone(), mount_path: v.mount_path.clone(), ..Default::default() }]
        }),
        ..Default::default()
    };
    let volumes = w.volume.map(|v| {
        vec![Volume {
            name: v.name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource { claim_name: v.claim_name.clone(), read_only: None }),
            ..Default::default()
        }]
    });
    // A ReadWriteOnce claim cannot be shared by old and new pods during a rolling update.
    let strategy = w.volume.map(|_| DeploymentStrategy { type_: Some("Recreate".into()), rolling_update: None });

    Deployment {
        metadata: meta(ns, w.name, w.labels),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector { match_labels: Some(w.selector.clone()), ..Default::default() },
            strategy,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(pod_labels), ..Default::default() }),
                spec: Some(PodSpec { containers: vec![container], volumes, ..Default::default() }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn service(ns: &str, name: &str, labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>, port: u16) -> Service {
    Service {
        metadata: meta(ns, name, labels),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".into()),
            selector: Some(selector.clone()),
            ports: Some(vec![ServicePort {
                name: Some("http".into()),
                port: i32::from(port),
                target_port: Some(IntOrString::Int(i32::from(port))),
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Host-matching route on `entrypoint`, forwarding to `service:port`.
pub struct Route<'a> {
    pub name: &'a str,
    pub host: &'a str,
    pub service: &'a str,
    pub port: u16,
    pub entrypoint: &'a str,
    pub tls_resolver: Option<&'a str>,
    pub labels: &'a BTreeMap<String, String>,
}

pub fn ingress_route(ns: &str, r: &Route<'_>) -> IngressRoute {
    let mut spec = json!({
        "entryPoints": [r.entrypoint],
        "routes": [{
            "match": format!("Host(`{}`)", r.host),
            "kind": "Rule",
            "services": [{ "name": r.service, "port": r.port }],
        }],
    });
    if let Some(resolver) = r.tls_resolver {
        spec["tls"] = json!({ "certResolver": resolver });
    }
    let mut obj = DynamicObject::new(r.name, &ingress_route_resource()).within(ns).data(json!({ "spec": spec }));
    obj.metadata.labels = Some(r.labels.clone());
    obj
}

/// Back-reference for a created object; `fallback_ns` covers servers that omit the namespace.
pub fn record(meta: &ObjectMeta, fallback_ns: &str) -> ResourceRecord {
    ResourceRecord {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_else(|| fallback_ns.to_string()),
        labels: meta.labels.clone().unwrap_or_default(),
    }
}
