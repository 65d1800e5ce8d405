use crate::executor::ExecutorConfig;
use crate::quotes::orchestrator::QuoteConfig;
use crate::risk::RiskConfig;
use crate::safety::SafetyConfig;
use crate::settlement::SettlementConfig;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub enable_tracing: bool,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub quotes: QuoteConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    /// PostgreSQL connection URL; `None` keeps everything in memory.
    #[serde(default)]
    pub postgres_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub ttl_secs: i64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self { ttl_secs: 86_400 }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "clearcore.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            enable_tracing: true,
            safety: SafetyConfig::default(),
            risk: RiskConfig::default(),
            quotes: QuoteConfig::default(),
            executor: ExecutorConfig::default(),
            settlement: SettlementConfig::default(),
            idempotency: IdempotencyConfig::default(),
            postgres_url: None,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Self {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .unwrap_or_else(|_| panic!("Failed to read config file: {}", config_path));
        serde_yaml::from_str(&content).expect("Failed to parse config yaml")
    }

    /// `load`, falling back to defaults when the file is absent.
    pub fn load_or_default(env: &str) -> Self {
        let config_path = format!("config/{}.yaml", env);
        match fs::read_to_string(&config_path) {
            Ok(content) => serde_yaml::from_str(&content).expect("Failed to parse config yaml"),
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.idempotency.ttl_secs, 86_400);
        assert_eq!(cfg.quotes.max_wait_ms, 3_000);
        assert_eq!(cfg.executor.max_commit_attempts, 3);
        assert_eq!(cfg.settlement.required_confirmations, 12);
        assert_eq!(cfg.safety.min_trade_amount, dec!(0.01));
        assert!(cfg.postgres_url.is_none());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
log_level: debug
log_dir: ./logs
log_file: core.log
use_json: true
rotation: hourly
enable_tracing: true
quotes:
  max_wait_ms: 500
"#;
        let cfg: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.quotes.max_wait_ms, 500);
        // Unspecified sections and fields come from Default.
        assert_eq!(cfg.quotes.discard_impact, dec!(0.05));
        assert_eq!(cfg.safety.cooldown_failures, 3);
    }
}
