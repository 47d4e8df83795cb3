//! Comparison strategies selected by script key.
//!
//! Built-in strategies are compiled into the binary. Scripts fetched from the
//! remote repository run through [`sandbox::ScriptedStrategy`], which
//! implements the same trait.

mod builtin;
pub mod sandbox;

pub use builtin::{CellDiff, HubVsSales};
pub use sandbox::{ENTRY_POINT, SandboxLimits, ScriptedStrategy};

use crate::error::ExecError;
use crate::grid::ResultGrid;
use crate::loader::DecodedWorkbook;
use crate::pipeline::CancelToken;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Entry shown in the script selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptInfo {
    pub key: String,
    pub label: String,
}

impl ScriptInfo {
    pub fn new(key: impl Into<String>, label: impl Into<String>) -> Self {
        ScriptInfo {
            key: key.into(),
            label: label.into(),
        }
    }
}

pub trait ComparisonStrategy: Send + Sync {
    fn key(&self) -> &str;

    fn label(&self) -> &str;

    /// Compare two decoded files. Implementations should check `cancel`
    /// between expensive steps and return [`ExecError::Cancelled`].
    fn compare(
        &self,
        first: &DecodedWorkbook,
        second: &DecodedWorkbook,
        cancel: &CancelToken,
    ) -> Result<ResultGrid, ExecError>;

    fn info(&self) -> ScriptInfo {
        ScriptInfo::new(self.key(), self.label())
    }
}

#[derive(Default)]
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn ComparisonStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        StrategyRegistry::default()
    }

    /// Registry holding every strategy compiled into the binary
    pub fn with_builtins() -> Self {
        let mut registry = StrategyRegistry::new();
        registry.register(Arc::new(HubVsSales::default()));
        registry.register(Arc::new(CellDiff));
        registry
    }

    /// Add a strategy; a later registration with the same key replaces the
    /// earlier one.
    pub fn register(&mut self, strategy: Arc<dyn ComparisonStrategy>) {
        self.strategies.retain(|s| s.key() != strategy.key());
        self.strategies.push(strategy);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn ComparisonStrategy>> {
        self.strategies.iter().find(|s| s.key() == key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.strategies.iter().any(|s| s.key() == key)
    }

    pub fn list(&self) -> Vec<ScriptInfo> {
        self.strategies.iter().map(|s| s.info()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    impl ComparisonStrategy for Fixed {
        fn key(&self) -> &str {
            "run5"
        }

        fn label(&self) -> &str {
            self.0
        }

        fn compare(
            &self,
            _first: &DecodedWorkbook,
            _second: &DecodedWorkbook,
            _cancel: &CancelToken,
        ) -> Result<ResultGrid, ExecError> {
            Ok(ResultGrid::empty())
        }
    }

    #[test]
    fn builtins_are_listed_in_registration_order() {
        let registry = StrategyRegistry::with_builtins();
        let keys: Vec<_> = registry.list().into_iter().map(|i| i.key).collect();
        assert_eq!(keys, vec!["run5", "cell-diff"]);
        assert!(registry.contains("cell-diff"));
        assert!(registry.get("run6").is_none());
    }

    #[test]
    fn registering_same_key_replaces() {
        let mut registry = StrategyRegistry::with_builtins();
        registry.register(Arc::new(Fixed("Override")));
        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.get("run5").unwrap().label(), "Override");
    }
}
