use serde_json::Value;

use super::Validator;
use crate::error::{ForemanError, Result};

/// `jsonschema`-backed validator reporting every violation with its path.
#[derive(Debug, Clone, Default)]
pub struct JsonSchemaValidator;

impl JsonSchemaValidator {
    pub fn new() -> Self {
        Self
    }
}

impl Validator for JsonSchemaValidator {
    fn validate(&self, values: &Value, schema: &Value) -> Result<Vec<String>> {
        let compiled = jsonschema::validator_for(schema)
            .map_err(|e| ForemanError::InvalidSpec(format!("invalid values schema: {}", e)))?;

        Ok(compiled
            .iter_errors(values)
            .map(|error| {
                let path = error.instance_path().to_string();
                if path.is_empty() {
                    error.to_string()
                } else {
                    format!("{} at {}", error, path)
                }
            })
            .collect())
    }
}
