use std::io::Write;
use std::path::Path;

use serde_json::Value;
use tempfile::NamedTempFile;

use super::command::Invocation;
use super::Templater;
use crate::error::{ForemanError, Result};
use crate::manifest::{self, Manifest};

/// Renders charts with `helm template <chart> -f <values>`.
pub struct HelmTemplater {
    helm: String,
}

impl HelmTemplater {
    pub fn new(helm: impl Into<String>) -> Self {
        Self { helm: helm.into() }
    }

    fn values_file(values: &Value) -> Result<NamedTempFile> {
        let yaml = serde_yaml::to_string(values)?;
        let mut file = tempfile::Builder::new()
            .prefix("foreman-values-")
            .suffix(".yaml")
            .tempfile()
            .map_err(|e| ForemanError::Template(format!("cannot create values file: {}", e)))?;
        file.write_all(yaml.as_bytes())
            .map_err(|e| ForemanError::io(file.path(), e))?;
        Ok(file)
    }
}

impl Templater for HelmTemplater {
    fn render(&self, chart: &Path, values: &Value) -> Result<Manifest> {
        let file = Self::values_file(values)?;
        let out = Invocation::new(&self.helm)
            .arg("template")
            .arg(chart.to_string_lossy())
            .arg("-f")
            .arg(file.path().to_string_lossy())
            .run()
            .map_err(|e| ForemanError::Template(e.to_string()))?;
        let rendered = manifest::decode_all(&out)?;
        log::debug!("{} rendered {} objects", chart.display(), rendered.len());
        Ok(rendered)
    }
}
