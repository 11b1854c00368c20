// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use smed_config::AgentConfig;
use smed_model::ToolSchema;

use crate::Tool;

/// Central registry holding all available tools, populated at startup.
#[derive(Default)]
pub struct Registry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas for every registered tool, name-sorted for a stable wire order.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Schemas visible to one agent: its allow-list when non-empty,
    /// minus its deny-list.
    pub fn schemas_for_agent(&self, agent: &AgentConfig) -> Vec<ToolSchema> {
        self.schemas()
            .into_iter()
            .filter(|s| agent.tools_allow.is_empty() || agent.tools_allow.contains(&s.name))
            .filter(|s| !agent.tools_deny.contains(&s.name))
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::{Tool, ToolContext, ToolError, ToolResult};

    /// Minimal no-op tool for registry tests.
    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn invoke(&self, _ctx: &ToolContext, input: Value) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::text(format!("echo:{input}")))
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = Registry::new();
        reg.register(EchoTool { name: "echo" });
        assert!(reg.get("echo").is_some());
    }

    #[test]
    fn get_unknown_returns_none() {
        let reg = Registry::new();
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn names_are_sorted() {
        let mut reg = Registry::new();
        reg.register(EchoTool { name: "b" });
        reg.register(EchoTool { name: "a" });
        assert_eq!(reg.names(), vec!["a", "b"]);
    }

    #[test]
    fn schemas_contain_descriptions() {
        let mut reg = Registry::new();
        reg.register(EchoTool { name: "t" });
        let schemas = reg.schemas();
        assert_eq!(schemas[0].description, "echoes its input");
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let mut reg = Registry::new();
        reg.register(EchoTool { name: "t" });
        reg.register(EchoTool { name: "t" });
        assert_eq!(reg.names().len(), 1);
    }

    #[test]
    fn empty_allow_list_exposes_all_tools() {
        let mut reg = Registry::new();
        reg.register(EchoTool { name: "read" });
        reg.register(EchoTool { name: "bash" });
        let agent = AgentConfig::default();
        assert_eq!(reg.schemas_for_agent(&agent).len(), 2);
    }

    #[test]
    fn allow_list_restricts_tools() {
        let mut reg = Registry::new();
        reg.register(EchoTool { name: "read" });
        reg.register(EchoTool { name: "bash" });
        let agent = AgentConfig {
            tools_allow: vec!["read".into()],
            ..AgentConfig::default()
        };
        let schemas = reg.schemas_for_agent(&agent);
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "read");
    }

    #[test]
    fn deny_list_wins_over_allow_list() {
        let mut reg = Registry::new();
        reg.register(EchoTool { name: "bash" });
        let agent = AgentConfig {
            tools_allow: vec!["bash".into()],
            tools_deny: vec!["bash".into()],
            ..AgentConfig::default()
        };
        assert!(reg.schemas_for_agent(&agent).is_empty());
    }
}
