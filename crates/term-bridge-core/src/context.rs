//! Launch parameters for a remote session.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of the session-open request.
///
/// `metadata` entries are flattened into the request body so apps can
/// pass launch fields the bridge does not know about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Task the session works on.
    pub task_id: String,

    /// Context file handed to the remote process.
    pub context_file: String,

    /// Arbitrary metadata for app-specific needs.
    #[serde(flatten)]
    pub metadata: HashMap<String, Value>,
}

impl LaunchRequest {
    /// Create a launch request with no metadata.
    #[must_use]
    pub fn new(task_id: impl Into<String>, context_file: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            context_file: context_file.into(),
            metadata: HashMap::new(),
        }
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}
