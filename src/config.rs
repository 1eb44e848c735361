/*
 * Construction-time settings for a `Toolkit`.
 */

use crate::types::Bounds;

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolkitConfig {
    /// Leading part of every generated window-class name.
    pub class_name_prefix: String,
    /// Class-name suffix of the coordination window.
    pub coordination_class_suffix: String,
    pub coordination_bounds: Bounds,
    /// How long `run_loop` keeps servicing events after it ends while accessibility clients are connected.
    pub accessibility_settle_timeout: Duration,
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            class_name_prefix: "UiConduitWndClass".to_string(),
            coordination_class_suffix: "ToolkitWindow".to_string(),
            coordination_bounds: Bounds::new(0, 0, 400, 300),
            accessibility_settle_timeout: Duration::from_secs(1),
        }
    }
}

impl ToolkitConfig {
    pub fn with_class_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.class_name_prefix = prefix.into();
        self
    }

    pub fn with_coordination_class_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.coordination_class_suffix = suffix.into();
        self
    }

    pub fn with_coordination_bounds(mut self, bounds: Bounds) -> Self {
        self.coordination_bounds = bounds;
        self
    }

    pub fn with_accessibility_settle_timeout(mut self, timeout: Duration) -> Self {
        self.accessibility_settle_timeout = timeout;
        self
    }
}
