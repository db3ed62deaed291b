//! Builders for manifest items and resource specs.

#![allow(dead_code)]

use serde_json::{json, Value};

use foreman::manifest::{ManifestItem, KIND_DEPLOYMENT, KIND_HPA, KIND_STATEFUL_SET, NAME_LABEL};
use foreman::resource::{AssetRef, ResourceSpec};
use foreman::strategy::ROTATION_ANNOTATION;

/// Builder for StatefulSet items.
pub struct StatefulSetBuilder {
    name: String,
    image: String,
    replicas: u64,
    service_name: Option<String>,
    rotation: Option<String>,
    labels: Vec<(String, String)>,
}

impl StatefulSetBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            image: "registry.example/app:1".to_string(),
            replicas: 1,
            service_name: None,
            rotation: None,
            labels: Vec::new(),
        }
    }

    pub fn image(mut self, image: &str) -> Self {
        self.image = image.to_string();
        self
    }

    pub fn replicas(mut self, replicas: u64) -> Self {
        self.replicas = replicas;
        self
    }

    /// `serviceName` cannot change in place, so changing it forces a rotation.
    pub fn service_name(mut self, service: &str) -> Self {
        self.service_name = Some(service.to_string());
        self
    }

    pub fn rotation(mut self, flag: &str) -> Self {
        self.rotation = Some(flag.to_string());
        self
    }

    pub fn pod_label(mut self, key: &str, value: &str) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    pub fn build(self) -> ManifestItem {
        let mut labels = serde_json::Map::new();
        labels.insert(NAME_LABEL.to_string(), json!(self.name));
        for (key, value) in self.labels {
            labels.insert(key, json!(value));
        }
        let mut item = ManifestItem::new(
            KIND_STATEFUL_SET,
            &self.name,
            json!({
                "replicas": self.replicas,
                "serviceName": self.service_name.unwrap_or_else(|| self.name.clone()),
                "template": {
                    "metadata": {"labels": labels},
                    "spec": {"containers": [{"name": "main", "image": self.image}]}
                },
                "volumeClaimTemplates": [{"metadata": {"name": "data"}}]
            }),
        );
        item.api_version = Some("apps/v1".to_string());
        if let Some(flag) = self.rotation {
            item.metadata
                .annotations
                .insert(ROTATION_ANNOTATION.to_string(), flag);
        }
        item
    }
}

pub fn statefulset(name: &str) -> StatefulSetBuilder {
    StatefulSetBuilder::new(name)
}

pub fn deployment(name: &str, image: &str, replicas: u64) -> ManifestItem {
    let mut item = ManifestItem::new(
        KIND_DEPLOYMENT,
        name,
        json!({
            "replicas": replicas,
            "template": {
                "metadata": {"labels": {NAME_LABEL: name}},
                "spec": {"containers": [{"name": "main", "image": image}]}
            }
        }),
    );
    item.api_version = Some("apps/v1".to_string());
    item
}

pub fn service(name: &str) -> ManifestItem {
    let mut item = ManifestItem::new(
        "Service",
        name,
        json!({"selector": {NAME_LABEL: name}, "ports": [{"port": 80}]}),
    );
    item.api_version = Some("v1".to_string());
    item
}

pub fn config_map(name: &str, data: Value) -> ManifestItem {
    let mut item = ManifestItem::new("ConfigMap", name, Value::Null);
    item.api_version = Some("v1".to_string());
    item.extra.insert("data".to_string(), data);
    item
}

pub fn hpa(name: &str, target: &str) -> ManifestItem {
    ManifestItem::new(
        KIND_HPA,
        name,
        json!({
            "scaleTargetRef": {"apiVersion": "apps/v1", "kind": KIND_STATEFUL_SET, "name": target},
            "minReplicas": 1,
            "maxReplicas": 4
        }),
    )
}

/// A spec for the harness's `web/1.0.0` asset.
pub fn web_spec(app: Value) -> ResourceSpec {
    ResourceSpec::new(AssetRef::new("web", "1.0.0"), app)
}
