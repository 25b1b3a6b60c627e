//! Per-service credential shapes.
//!
//! Each third-party service registers a `CredentialSchema`; the vault looks
//! the schema up by service id before encrypting anything.

use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Shape check for one service's credential JSON.
pub trait CredentialSchema: Send + Sync {
    fn service(&self) -> &str;

    fn validate(&self, credentials: &serde_json::Value) -> Result<()>;

    /// Fields holding account identifiers, shown masked rather than redacted.
    fn identifier_fields(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Portal login: a fixed-length identifier plus a secret string.
#[derive(Debug, Clone)]
pub struct PortalLoginSchema {
    pub service: String,
    pub identifier_field: String,
    pub identifier_len: usize,
    pub numeric_identifier: bool,
    pub secret_field: String,
}

impl CredentialSchema for PortalLoginSchema {
    fn service(&self) -> &str {
        &self.service
    }

    fn validate(&self, credentials: &serde_json::Value) -> Result<()> {
        let obj = credentials.as_object().ok_or_else(|| {
            Error::Validation(format!("{} credentials must be an object", self.service))
        })?;

        let identifier = obj
            .get(&self.identifier_field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::Validation(format!(
                    "{} credentials require a string '{}'",
                    self.service, self.identifier_field
                ))
            })?;
        let len = identifier.chars().count();
        if len != self.identifier_len {
            return Err(Error::Validation(format!(
                "{} {} must be exactly {} characters long, got {}",
                self.service, self.identifier_field, self.identifier_len, len
            )));
        }
        if self.numeric_identifier && !identifier.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::Validation(format!(
                "{} {} must contain only digits",
                self.service, self.identifier_field
            )));
        }

        match obj.get(&self.secret_field).and_then(|v| v.as_str()) {
            Some(s) if !s.is_empty() => Ok(()),
            _ => Err(Error::Validation(format!(
                "{} credentials require a non-empty '{}'",
                self.service, self.secret_field
            ))),
        }
    }

    fn identifier_fields(&self) -> Vec<String> {
        vec![self.identifier_field.clone()]
    }
}

/// API-key service: a single non-empty string field.
#[derive(Debug, Clone)]
pub struct ApiKeySchema {
    pub service: String,
    pub field: String,
}

impl CredentialSchema for ApiKeySchema {
    fn service(&self) -> &str {
        &self.service
    }

    fn validate(&self, credentials: &serde_json::Value) -> Result<()> {
        match credentials.get(&self.field).and_then(|v| v.as_str()) {
            Some(s) if !s.trim().is_empty() => Ok(()),
            _ => Err(Error::Validation(format!(
                "{} credentials require a non-empty '{}'",
                self.service, self.field
            ))),
        }
    }
}

/// Service id -> schema.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<dyn CredentialSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the services the tracker integrates with out of the box.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(Arc::new(PortalLoginSchema {
            service: "epfo".to_string(),
            identifier_field: "identifier".to_string(),
            identifier_len: 12,
            numeric_identifier: true,
            secret_field: "secret".to_string(),
        }));
        reg.register(Arc::new(ApiKeySchema {
            service: "alpha_vantage".to_string(),
            field: "api_key".to_string(),
        }));
        reg
    }

    pub fn register(&mut self, schema: Arc<dyn CredentialSchema>) {
        self.schemas.insert(schema.service().to_string(), schema);
    }

    pub fn get(&self, service: &str) -> Option<Arc<dyn CredentialSchema>> {
        self.schemas.get(service).cloned()
    }

    pub fn services(&self) -> Vec<String> {
        let mut out: Vec<String> = self.schemas.keys().cloned().collect();
        out.sort();
        out
    }

    #[tracing::instrument(level = "debug", skip(self, credentials))]
    pub fn validate(&self, service: &str, credentials: &serde_json::Value) -> Result<()> {
        let schema = self
            .get(service)
            .ok_or_else(|| Error::Validation(format!("unsupported service '{service}'")))?;
        schema.validate(credentials)
    }
}
