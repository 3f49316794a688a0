//! # Engine Configuration
//!
//! The backend is chosen once, from configuration, and injected into the
//! builder. Nothing else in the engine looks at a global flag.
//!
//! ```json
//! { "backend": "eager", "small_number": 1e-6 }
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backend::{Backend, DeferredBackend, EagerBackend};
use crate::error::CoreError;

/// Default clamping epsilon for numerically sensitive graph functions.
pub const SMALL_NUMBER: f32 = 1e-6;

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `"deferred"` (alias `"graph"`) or `"eager"`.
    pub backend: String,
    /// Epsilon used to keep logs and divisions finite.
    pub small_number: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: "deferred".to_string(),
            small_number: SMALL_NUMBER,
        }
    }
}

impl EngineConfig {
    pub fn eager() -> Self {
        Self {
            backend: "eager".to_string(),
            ..Self::default()
        }
    }

    pub fn with_small_number(mut self, small_number: f32) -> Self {
        self.small_number = small_number;
        self
    }

    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let config: Self = serde_json::from_str(json).map_err(|e| CoreError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !(self.small_number > 0.0 && self.small_number < 1.0) {
            return Err(CoreError::InvalidConfig {
                reason: format!("small_number must be in (0, 1), got {}", self.small_number),
            });
        }
        Ok(())
    }
}

/// Instantiate the backend named by `config`.
pub fn backend_from_config(config: &EngineConfig) -> Result<Arc<dyn Backend>, CoreError> {
    match config.backend.as_str() {
        "deferred" | "graph" => Ok(Arc::new(DeferredBackend::new())),
        "eager" => Ok(Arc::new(EagerBackend::new())),
        other => Err(CoreError::BackendUnavailable {
            name: other.to_string(),
            reason: "expected one of: deferred, graph, eager".to_string(),
        }),
    }
}
