//! Platform-wide `global` values injected into every render.
//!
//! The base comes from `assets/global/<cluster>.yaml` in the backing store.
//! Global-spec plugins then pull selected keys from other store objects whose
//! path is templated on the target and the app values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::RemoteBundleStore;
use crate::error::{ForemanError, Result};

/// App keys that may appear as `{key}` placeholders in plugin URLs.
const APP_PLACEHOLDERS: [&str; 3] = ["area", "mode", "context"];

/// Copies `keys` of the YAML object at `url` into `global.<name>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSpecPlugin {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub keys: Vec<String>,
}

impl GlobalSpecPlugin {
    fn is_complete(&self) -> bool {
        !self.name.is_empty() && !self.url.is_empty() && !self.keys.is_empty()
    }
}

/// What the global values are being built for.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub cluster: &'a str,
    pub namespace: &'a str,
    pub name: &'a str,
}

pub fn global_spec_path(cluster: &str) -> String {
    format!("assets/global/{}.yaml", cluster)
}

fn placeholder_value(app: &Value, key: &str) -> Option<String> {
    match app.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Resolves the plugin URL, or `None` when the app lacks a placeholder value.
fn resolve_url(plugin: &GlobalSpecPlugin, target: Target<'_>, app: &Value) -> Option<String> {
    let mut url = plugin
        .url
        .replace("{cluster}", target.cluster)
        .replace("{namespace}", target.namespace)
        .replace("{name}", target.name);
    for key in APP_PLACEHOLDERS {
        let placeholder = format!("{{{}}}", key);
        if url.contains(&placeholder) {
            let value = placeholder_value(app, key)?;
            url = url.replace(&placeholder, &value);
        }
    }
    Some(url)
}

fn load_plugin(
    store: &dyn RemoteBundleStore,
    plugin: &GlobalSpecPlugin,
    target: Target<'_>,
    app: &Value,
) -> Result<Option<Value>> {
    let Some(url) = resolve_url(plugin, target, app) else {
        tracing::debug!("skipping global spec plugin {}: placeholder not set", plugin.name);
        return Ok(None);
    };
    let raw = store.read(&url)?;
    let values: Value = serde_yaml::from_str(&raw)?;
    let selected: Map<String, Value> = plugin
        .keys
        .iter()
        .map(|key| (key.clone(), values.get(key).cloned().unwrap_or(Value::Null)))
        .collect();
    Ok(Some(Value::Object(selected)))
}

/// Builds the platform `global` values for `target`.
pub fn platform_values(
    store: &dyn RemoteBundleStore,
    target: Target<'_>,
    plugins: &[GlobalSpecPlugin],
    app: &Value,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Value> {
    let path = global_spec_path(target.cluster);
    let raw = store.read(&path)?;
    let document: Value = serde_yaml::from_str(&raw)?;
    let mut global = match document.get("global") {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    tracing::debug!("loaded global spec {}", path);

    let ts = now.timestamp();
    global.insert("namespace".into(), Value::from(target.namespace));
    global.insert("cluster".into(), Value::from(target.cluster));
    global.insert("name".into(), Value::from(target.name));
    global.insert("ts".into(), Value::from(ts));
    global.insert("deployTime".into(), Value::from(ts.to_string()));

    for plugin in plugins.iter().filter(|p| p.is_complete()) {
        let loaded = load_plugin(store, plugin, target, app).map_err(|e| {
            ForemanError::Store(format!("error loading global spec plugin {}: {}", plugin.name, e))
        })?;
        if let Some(values) = loaded {
            global.insert(plugin.name.clone(), values);
        }
    }
    Ok(Value::Object(global))
}
