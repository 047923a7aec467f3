use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cadence_types::{CadenceError, Result};

/// Definition of a tool that can be presented to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A capability a stage may consult while producing its output.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, arguments: serde_json::Value) -> Result<String>;
}

/// Registry that maps tool identifiers to capabilities.
///
/// Lookups are by name; iteration is name-ordered so the definitions sent to a
/// model are stable between runs.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let def = tool.definition();
        tracing::debug!(tool = %def.name, "Registering tool");
        self.tools.insert(def.name, Arc::new(tool));
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Definitions for exactly the named tools, in the order given.
    ///
    /// Fails on the first name with no registered tool.
    pub fn definitions_for<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<ToolDefinition>> {
        names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.tools
                    .get(name)
                    .map(|t| t.definition())
                    .ok_or_else(|| CadenceError::ToolError {
                        tool: name.to_string(),
                        message: "no tool registered under this name".into(),
                    })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StaticSearch;

    #[async_trait]
    impl Tool for StaticSearch {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "web_search".into(),
                description: "Search the web".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {"query": {"type": "string"}},
                    "required": ["query"]
                }),
            }
        }

        async fn execute(&self, arguments: serde_json::Value) -> Result<String> {
            let query = arguments["query"].as_str().unwrap_or_default();
            Ok(format!("results for {query}"))
        }
    }

    struct Clock;

    #[async_trait]
    impl Tool for Clock {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "clock".into(),
                description: "Current date".into(),
                parameters: json!({"type": "object"}),
            }
        }

        async fn execute(&self, _arguments: serde_json::Value) -> Result<String> {
            Ok("2024-01-01".into())
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = ToolRegistry::new();
        assert!(registry.is_empty());
        registry.register(StaticSearch);
        assert!(registry.contains("web_search"));
        assert!(registry.get("web_search").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_removes_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(StaticSearch);
        assert!(registry.unregister("web_search"));
        assert!(!registry.unregister("web_search"));
        assert!(registry.is_empty());
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(StaticSearch);
        registry.register(Clock);
        assert_eq!(registry.names(), vec!["clock", "web_search"]);
    }

    #[test]
    fn definitions_for_follows_requested_order() {
        let mut registry = ToolRegistry::new();
        registry.register(StaticSearch);
        registry.register(Clock);

        let defs = registry.definitions_for(&["web_search", "clock"]).unwrap();
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["web_search", "clock"]);
    }

    #[test]
    fn definitions_for_unknown_tool_errors() {
        let registry = ToolRegistry::new();
        let err = registry.definitions_for(&["web_search"]).unwrap_err();
        assert!(matches!(err, CadenceError::ToolError { ref tool, .. } if tool == "web_search"));
    }

    #[tokio::test]
    async fn execute_through_registry() {
        let mut registry = ToolRegistry::new();
        registry.register(StaticSearch);
        let out = registry
            .get("web_search")
            .unwrap()
            .execute(json!({"query": "fitness trackers"}))
            .await
            .unwrap();
        assert_eq!(out, "results for fitness trackers");
    }
}
