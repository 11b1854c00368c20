// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Root directory for persisted sessions, messages and parts.
    /// Defaults to `<data dir>/smed` when not set.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    #[serde(default)]
    pub model: ModelConfig,
    /// Named agent profiles.  The prompt endpoint selects one by name;
    /// `"build"` is the default.
    ///
    /// ```yaml
    /// agents:
    ///   build:
    ///     permissions:
    ///       edit: allow
    ///       bash:
    ///         "git push *": ask
    ///         "rm *": ask
    ///   plan:
    ///     permissions:
    ///       edit: deny
    ///     tools_deny: [bash]
    /// ```
    ///
    /// When the section is absent the built-in `build` / `plan` profiles
    /// apply.
    #[serde(default = "default_agents")]
    pub agents: HashMap<String, AgentConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage_dir: None,
            model: ModelConfig::default(),
            agents: default_agents(),
        }
    }
}

impl Config {
    /// Look up an agent profile by name, falling back to the built-in
    /// `"build"` defaults for unknown names.
    pub fn agent(&self, name: &str) -> AgentConfig {
        self.agents.get(name).cloned().unwrap_or_default()
    }
}

fn default_agents() -> HashMap<String, AgentConfig> {
    let mut agents = HashMap::new();
    agents.insert("build".to_string(), AgentConfig::default());
    agents.insert(
        "plan".to_string(),
        AgentConfig {
            permissions: PermissionConfig {
                edit: PermissionAction::Deny,
                ..PermissionConfig::default()
            },
            tools_deny: vec!["write".into(), "edit".into(), "bash".into()],
            ..AgentConfig::default()
        },
    );
    agents
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    4096
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier, e.g. "anthropic" | "openai" | "mock".
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Base URL override for local proxies and gateways
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            name: "claude-sonnet-4-5".into(),
            api_key_env: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
        }
    }
}

/// What to do with a gated tool call before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    /// Run without asking
    Allow,
    /// Never run
    Deny,
    /// Block until the user replies
    Ask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Tool names this agent may use.  Empty means "all registered tools".
    #[serde(default)]
    pub tools_allow: Vec<String>,
    /// Tool names withheld from this agent.  Applied after `tools_allow`.
    #[serde(default)]
    pub tools_deny: Vec<String>,
    #[serde(default)]
    pub permissions: PermissionConfig,
    /// Provider-turn cap override for this agent.
    #[serde(default)]
    pub max_steps: Option<u32>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tools_allow: Vec::new(),
            tools_deny: Vec::new(),
            permissions: PermissionConfig::default(),
            max_steps: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionConfig {
    #[serde(default = "allow")]
    pub edit: PermissionAction,
    #[serde(default = "ask")]
    pub webfetch: PermissionAction,
    #[serde(default = "ask")]
    pub external_directory: PermissionAction,
    /// Command-shape patterns for the bash tool, matched most-specific
    /// first: `"name sub *"` beats `"name *"` beats `"name"` beats `"*"`.
    #[serde(default)]
    pub bash: HashMap<String, PermissionAction>,
    /// Action when no pattern matches.
    #[serde(default = "ask")]
    pub default: PermissionAction,
}

fn allow() -> PermissionAction {
    PermissionAction::Allow
}

fn ask() -> PermissionAction {
    PermissionAction::Ask
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            edit: PermissionAction::Allow,
            webfetch: PermissionAction::Ask,
            external_directory: PermissionAction::Ask,
            bash: HashMap::new(),
            default: PermissionAction::Ask,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_build_and_plan_agents() {
        let cfg = Config::default();
        assert!(cfg.agents.contains_key("build"));
        assert!(cfg.agents.contains_key("plan"));
    }

    #[test]
    fn plan_agent_denies_edit() {
        let cfg = Config::default();
        assert_eq!(cfg.agent("plan").permissions.edit, PermissionAction::Deny);
    }

    #[test]
    fn unknown_agent_falls_back_to_defaults() {
        let cfg = Config::default();
        let agent = cfg.agent("nonexistent");
        assert_eq!(agent.permissions.edit, PermissionAction::Allow);
        assert!(agent.tools_allow.is_empty());
    }

    #[test]
    fn permission_action_serializes_lowercase() {
        let json = serde_json::to_string(&PermissionAction::Ask).unwrap();
        assert_eq!(json, "\"ask\"");
    }

    #[test]
    fn bash_patterns_round_trip_through_yaml() {
        let yaml = "permissions:\n  bash:\n    \"git push *\": ask\n    \"rm *\": deny\n";
        let agent: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            agent.permissions.bash.get("rm *"),
            Some(&PermissionAction::Deny)
        );
    }

    #[test]
    fn server_config_defaults() {
        let s = ServerConfig::default();
        assert_eq!(s.host, "127.0.0.1");
        assert_eq!(s.port, 4096);
    }
}
