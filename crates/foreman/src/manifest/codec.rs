//! Multi-document YAML encoding of manifests.

use serde::Deserialize;
use serde_json::Value;

use super::item::{Manifest, ManifestItem};
use crate::error::Result;

/// Parses a `---`-separated YAML stream. Empty documents and documents
/// without a string `kind` are dropped.
pub fn decode_all(text: &str) -> Result<Manifest> {
    let mut manifest = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = Value::deserialize(document)?;
        let has_kind = value.get("kind").is_some_and(Value::is_string);
        if has_kind {
            manifest.push(serde_json::from_value(value)?);
        }
    }
    Ok(manifest)
}

/// Emits every item as its own YAML document.
pub fn encode_all(manifest: &[ManifestItem]) -> Result<String> {
    let mut out = String::new();
    for item in manifest {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(item)?);
    }
    Ok(out)
}

/// Parses a single object.
pub fn decode_item(text: &str) -> Result<ManifestItem> {
    Ok(serde_yaml::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RENDERED: &str = r#"
---
# Source: app/templates/service.yaml
apiVersion: v1
kind: Service
metadata:
  name: web
  labels:
    app.kubernetes.io/name: web
spec:
  ports:
    - port: 80
---
# Source: app/templates/empty.yaml
---
apiVersion: apps/v1
kind: StatefulSet
metadata:
  name: web
  annotations:
    foreman/rotation: disabled
spec:
  replicas: 2
  serviceName: web
  template:
    metadata:
      labels:
        app.kubernetes.io/name: web
    spec:
      containers:
        - name: web
          image: nginx:1.25
"#;

    #[test]
    fn test_decode_skips_empty_documents() {
        let manifest = decode_all(RENDERED).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest[0].kind, "Service");
        assert_eq!(manifest[1].kind, "StatefulSet");
        assert_eq!(manifest[1].replicas(), Some(2));
    }

    #[test]
    fn test_decode_skips_documents_without_kind() {
        let manifest = decode_all("a: 1\n---\nkind: Secret\nmetadata:\n  name: s\n").unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].name(), "s");
    }

    #[test]
    fn test_encode_then_decode_is_lossless() {
        let manifest = decode_all(RENDERED).unwrap();
        let encoded = encode_all(&manifest).unwrap();
        assert_eq!(decode_all(&encoded).unwrap(), manifest);
    }

    #[test]
    fn test_decode_empty_stream() {
        assert!(decode_all("").unwrap().is_empty());
    }
}
