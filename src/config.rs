//! Runtime settings

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::util::Result;

/// Environment variable naming a settings file.
pub const CONFIG_ENV: &str = "RTACCEL_CONFIG";

/// Traversal stack slots for branching factor 4 over up to 2^24 leaves.
pub const DEFAULT_TRAVERSAL_STACK_ENTRIES: usize = 76;

/// Settings shared by the builders, the queue and the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Execution
    pub parallel: bool,

    // Traversal
    pub traversal_stack_entries: usize,
    pub max_ray_recursion_depth: u32,

    // Copy kernel
    pub deserialize_workgroups: u32,

    // Logging (tracing EnvFilter syntax)
    pub log_filter: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            parallel: true,
            traversal_stack_entries: DEFAULT_TRAVERSAL_STACK_ENTRIES,
            max_ray_recursion_depth: 31,
            deserialize_workgroups: 512,
            log_filter: None,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file; missing fields take defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut settings: Self = serde_json::from_str(&text)?;
        settings.validate();
        Ok(settings)
    }

    /// Settings from `RTACCEL_CONFIG`, or defaults when unset
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }

    /// Save settings as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn validate(&mut self) {
        // a stack must hold at least the root and one level of children
        if self.traversal_stack_entries < 4 {
            self.traversal_stack_entries = DEFAULT_TRAVERSAL_STACK_ENTRIES;
        }
        if self.deserialize_workgroups == 0 {
            self.deserialize_workgroups = 512;
        }
    }
}
