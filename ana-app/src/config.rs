//! Configuration loader: TOML file, env-var overrides, then validation.
//! Every tunable of the debounce/routing pipeline lives here; nothing in the
//! core reads the environment directly.

use crate::router::Branch;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnaConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub intent: IntentConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub branches: BranchesConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub evolution: EvolutionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8300".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Quiescence period after the last fragment before a burst is complete.
    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: u64,
    /// Added to the debounce window to form the burst TTL safety net.
    #[serde(default = "default_ttl_margin_seconds")]
    pub ttl_margin_seconds: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            debounce_seconds: default_debounce_seconds(),
            ttl_margin_seconds: default_ttl_margin_seconds(),
        }
    }
}

fn default_debounce_seconds() -> u64 {
    4
}

fn default_ttl_margin_seconds() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntentConfig {
    /// Strictly shorter than typical conversation gaps so a new burst
    /// reclassifies rather than reusing a stale decision.
    #[serde(default = "default_intent_cache_ttl")]
    pub cache_ttl_seconds: u64,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: default_intent_cache_ttl(),
        }
    }
}

fn default_intent_cache_ttl() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl")]
    pub history_ttl_seconds: u64,
    #[serde(default = "default_session_max")]
    pub history_max: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_ttl_seconds: default_session_ttl(),
            history_max: default_session_max(),
        }
    }
}

fn default_session_ttl() -> u64 {
    1800
}

fn default_session_max() -> usize {
    20
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BranchMemoryConfig {
    pub history_ttl_seconds: u64,
    pub history_max: usize,
}

impl Default for BranchMemoryConfig {
    fn default() -> Self {
        Self {
            history_ttl_seconds: 300,
            history_max: 10,
        }
    }
}

/// Per-branch memory depth. Each conversational stage needs a different
/// horizon: greeting is shallow, qualification is deep.
#[derive(Debug, Clone, Deserialize)]
pub struct BranchesConfig {
    #[serde(default = "default_greeting_memory")]
    pub greeting: BranchMemoryConfig,
    #[serde(default = "default_scheduling_memory")]
    pub scheduling: BranchMemoryConfig,
    #[serde(default = "default_qualification_memory")]
    pub qualification: BranchMemoryConfig,
    #[serde(default = "default_documentation_memory")]
    pub documentation: BranchMemoryConfig,
    #[serde(default)]
    pub unknown: BranchMemoryConfig,
}

impl Default for BranchesConfig {
    fn default() -> Self {
        Self {
            greeting: default_greeting_memory(),
            scheduling: default_scheduling_memory(),
            qualification: default_qualification_memory(),
            documentation: default_documentation_memory(),
            unknown: BranchMemoryConfig::default(),
        }
    }
}

fn default_greeting_memory() -> BranchMemoryConfig {
    BranchMemoryConfig {
        history_ttl_seconds: 180,
        history_max: 5,
    }
}

fn default_scheduling_memory() -> BranchMemoryConfig {
    BranchMemoryConfig {
        history_ttl_seconds: 600,
        history_max: 15,
    }
}

fn default_qualification_memory() -> BranchMemoryConfig {
    BranchMemoryConfig {
        history_ttl_seconds: 900,
        history_max: 20,
    }
}

fn default_documentation_memory() -> BranchMemoryConfig {
    BranchMemoryConfig {
        history_ttl_seconds: 600,
        history_max: 10,
    }
}

impl BranchesConfig {
    pub fn as_map(&self) -> HashMap<Branch, BranchMemoryConfig> {
        HashMap::from([
            (Branch::Greeting, self.greeting),
            (Branch::Scheduling, self.scheduling),
            (Branch::Qualification, self.qualification),
            (Branch::Documentation, self.documentation),
            (Branch::Unknown, self.unknown),
        ])
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "default_escalation_triggers")]
    pub triggers: Vec<String>,
    /// Broker address that receives handoff alerts.
    #[serde(default)]
    pub human_address: String,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            triggers: default_escalation_triggers(),
            human_address: String::new(),
        }
    }
}

fn default_escalation_triggers() -> Vec<String> {
    [
        "falar com pessoa",
        "atendente",
        "humano",
        "gerente",
        "urgente",
        "reclamação",
        "corretor",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvolutionConfig {
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub instance: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home)
        .join(".ana-agent")
        .join("exchanges.db")
        .display()
        .to_string()
}

impl AnaConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
            toml::from_str(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?
        } else {
            AnaConfig::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            if !v.trim().is_empty() {
                self.llm.api_key = v;
            }
        }
        if let Ok(v) = std::env::var("ANA_MODEL") {
            if !v.trim().is_empty() {
                self.llm.model = v;
            }
        }
        if let Ok(v) = std::env::var("EVOLUTION_API_URL") {
            if !v.trim().is_empty() {
                self.evolution.api_url = v;
            }
        }
        if let Ok(v) = std::env::var("EVOLUTION_API_KEY") {
            if !v.trim().is_empty() {
                self.evolution.api_key = v;
            }
        }
        if let Ok(v) = std::env::var("EVOLUTION_INSTANCE") {
            if !v.trim().is_empty() {
                self.evolution.instance = v;
            }
        }
        if let Ok(v) = std::env::var("ANA_HUMAN_ADDRESS") {
            if !v.trim().is_empty() {
                self.escalation.human_address = v;
            }
        }
        if let Ok(v) = std::env::var("ANA_BIND_ADDR") {
            if !v.trim().is_empty() {
                self.server.bind_addr = v;
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.buffer.debounce_seconds == 0 {
            return Err(anyhow::anyhow!("buffer.debounce_seconds must be > 0"));
        }
        if self.intent.cache_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("intent.cache_ttl_seconds must be > 0"));
        }
        if self.session.history_max == 0 {
            return Err(anyhow::anyhow!("session.history_max must be > 0"));
        }
        for (branch, memory) in self.branches.as_map() {
            if memory.history_max == 0 {
                return Err(anyhow::anyhow!(
                    "branches.{branch}.history_max must be > 0"
                ));
            }
        }
        self.server
            .bind_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow::anyhow!("server.bind_addr is invalid: {e}"))?;
        Ok(())
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.buffer.debounce_seconds)
    }

    pub fn burst_ttl_margin(&self) -> Duration {
        Duration::from_secs(self.buffer.ttl_margin_seconds)
    }

    pub fn intent_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.intent.cache_ttl_seconds)
    }

    pub fn session_history_ttl(&self) -> Duration {
        Duration::from_secs(self.session.history_ttl_seconds)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".ana-agent").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_production_tuning() {
        let cfg = AnaConfig::default();
        assert_eq!(cfg.buffer.debounce_seconds, 4);
        assert_eq!(cfg.buffer.ttl_margin_seconds, 5);
        assert_eq!(cfg.intent.cache_ttl_seconds, 60);
        assert_eq!(cfg.branches.greeting.history_max, 5);
        assert_eq!(cfg.branches.qualification.history_ttl_seconds, 900);
        assert!(cfg.escalation.triggers.contains(&"urgente".to_string()));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let cfg: AnaConfig = toml::from_str(
            r#"
[buffer]
debounce_seconds = 2

[branches.qualification]
history_ttl_seconds = 1200
history_max = 30
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.buffer.debounce_seconds, 2);
        assert_eq!(cfg.buffer.ttl_margin_seconds, 5);
        assert_eq!(cfg.branches.qualification.history_max, 30);
        assert_eq!(cfg.branches.greeting.history_max, 5);
    }

    #[test]
    fn rejects_zero_debounce_window() {
        let cfg: AnaConfig = toml::from_str("[buffer]\ndebounce_seconds = 0\n").expect("parse");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_invalid_bind_addr() {
        let cfg: AnaConfig =
            toml::from_str("[server]\nbind_addr = \"not-an-addr\"\n").expect("parse");
        assert!(cfg.validate().is_err());
    }
}
