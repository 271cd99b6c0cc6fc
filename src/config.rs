//! Configuration types for the classification and routing engine.

use crate::rate_guard::KeyStrategy;
use crate::router::Tier;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Longest accepted rate window, 31 days.
pub const MAX_WINDOW_SECS: u64 = 31 * 24 * 60 * 60;

/// Configuration errors detected before the engine is built.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Recommendation thresholds are out of range or out of order.
    #[error("recommendation thresholds must satisfy monitor <= challenge <= block <= 100 (got {monitor}/{challenge}/{block})")]
    Thresholds { monitor: u8, challenge: u8, block: u8 },

    /// A routing band points above the score range.
    #[error("routing band min_score {0} exceeds 100")]
    RoutingBand(u8),

    /// Traffic split does not total 100%.
    #[error("traffic split must total 100% (got {0:.2})")]
    TrafficSplit(f64),

    /// Rate window or count is zero, or the window is too long.
    #[error("rate guard max_requests must be non-zero and window_secs within 1..=2678400")]
    RateWindow,

    /// A backend address is not an http(s) URL.
    #[error("backend address for {tier} must start with http:// or https:// (got {address:?})")]
    Backend { tier: &'static str, address: String },

    /// A datacenter range is not valid CIDR notation.
    #[error("invalid datacenter range {0:?}")]
    Cidr(String),

    /// Domain name is empty.
    #[error("domain name must not be empty")]
    DomainName,
}

/// Main configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Classifier settings
    pub classifier: ClassifierConfig,

    /// Tier routing policy
    pub routing: RoutingConfig,

    /// Engine-level request-rate guard
    pub rate_guard: RateGuardConfig,
}

impl EngineConfig {
    /// Load configuration from a JSON or YAML file, chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = if path.extension().is_some_and(|e| e == "yaml" || e == "yml") {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject incoherent settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.classifier.thresholds;
        if !(t.monitor <= t.challenge && t.challenge <= t.block && t.block <= 100) {
            return Err(ConfigError::Thresholds {
                monitor: t.monitor,
                challenge: t.challenge,
                block: t.block,
            });
        }

        for band in &self.routing.bands {
            if band.min_score > 100 {
                return Err(ConfigError::RoutingBand(band.min_score));
            }
        }

        if !(1..=MAX_WINDOW_SECS).contains(&self.rate_guard.window_secs)
            || self.rate_guard.max_requests == 0
        {
            return Err(ConfigError::RateWindow);
        }

        for range in &self.classifier.network.datacenter_ranges {
            if range.parse::<ipnet::IpNet>().is_err() {
                return Err(ConfigError::Cidr(range.clone()));
            }
        }

        Ok(())
    }
}

/// Classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Score thresholds for recommendations
    pub thresholds: RecommendationThresholds,

    /// Enable user-agent signals
    pub user_agent_signals: bool,

    /// Enable network-origin signals
    pub network_signals: bool,

    /// Enable header signals
    pub header_signals: bool,

    /// Enable behavioral signals
    pub behavioral_signals: bool,

    /// User-agent rule settings
    pub user_agent: UserAgentConfig,

    /// Network rule settings
    pub network: NetworkConfig,

    /// Header rule settings
    pub headers: HeaderConfig,

    /// Behavioral rule settings
    pub behavioral: BehavioralConfig,

    /// Known good crawler and monitor signatures
    pub known_good_agents: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            thresholds: RecommendationThresholds::default(),
            user_agent_signals: true,
            network_signals: true,
            header_signals: true,
            behavioral_signals: true,
            user_agent: UserAgentConfig::default(),
            network: NetworkConfig::default(),
            headers: HeaderConfig::default(),
            behavioral: BehavioralConfig::default(),
            known_good_agents: [
                "googlebot",
                "bingbot",
                "yandexbot",
                "duckduckbot",
                "baiduspider",
                "facebookexternalhit",
                "twitterbot",
                "linkedinbot",
                "slackbot",
                "uptimerobot",
                "pingdom",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Score thresholds mapping a score to a recommendation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendationThresholds {
    /// Score at or above which to monitor
    pub monitor: u8,

    /// Score at or above which to challenge
    pub challenge: u8,

    /// Score at or above which to block
    pub block: u8,
}

impl Default for RecommendationThresholds {
    fn default() -> Self {
        Self {
            monitor: 30,
            challenge: 50,
            block: 80,
        }
    }
}

/// User-agent rule settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAgentConfig {
    /// Agents shorter than this are treated as missing
    pub min_length: usize,

    /// Lower bound of the "usual" length range
    pub usual_min_length: usize,

    /// Upper bound of the "usual" length range
    pub usual_max_length: usize,

    /// Automation tool substrings (matched case-insensitively)
    pub automation_signatures: Vec<String>,

    /// Browser engine markers; an agent without any of them is suspicious
    pub browser_markers: Vec<String>,
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        Self {
            min_length: 10,
            usual_min_length: 30,
            usual_max_length: 500,
            automation_signatures: [
                "bot",
                "crawler",
                "spider",
                "scraper",
                "curl",
                "wget",
                "httpie",
                "python",
                "java",
                "go-http",
                "node-fetch",
                "axios",
                "okhttp",
                "headless",
                "phantom",
                "selenium",
                "puppeteer",
                "playwright",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            browser_markers: ["mozilla", "chrome", "safari", "firefox", "edge"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Network-origin rule settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Penalty when the client IP is absent or unparsable
    pub missing_ip_penalty: u8,

    /// Penalty when the client IP is in a datacenter range
    pub datacenter_penalty: u8,

    /// Known datacenter ranges (CIDR notation)
    pub datacenter_ranges: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            missing_ip_penalty: 20,
            datacenter_penalty: 15,
            datacenter_ranges: vec![
                "23.0.0.0/8".to_string(),
                "34.0.0.0/8".to_string(),
                "52.0.0.0/8".to_string(),
                "104.0.0.0/8".to_string(),
            ],
        }
    }
}

/// Header rule settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderConfig {
    /// Headers that indicate a proxy hop, checked in order
    pub proxy_headers: Vec<String>,

    /// Penalty per proxy header present
    pub proxy_header_penalty: u8,

    /// Headers that browsers almost always send, checked in order
    pub browser_headers: Vec<String>,

    /// Penalty when more than one browser header is missing
    pub missing_browser_headers_penalty: u8,

    /// Penalty for `Accept: */*`
    pub generic_accept_penalty: u8,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            proxy_headers: vec![
                "x-forwarded-for".to_string(),
                "x-real-ip".to_string(),
                "via".to_string(),
                "x-proxy".to_string(),
            ],
            proxy_header_penalty: 5,
            browser_headers: vec![
                "accept".to_string(),
                "accept-language".to_string(),
                "accept-encoding".to_string(),
            ],
            missing_browser_headers_penalty: 10,
            generic_accept_penalty: 5,
        }
    }
}

/// Behavioral rule settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehavioralConfig {
    /// Requests per minute above which the rate is suspicious
    pub max_request_rate: f64,

    /// Page views per second above which navigation is suspicious
    pub max_page_view_rate: f64,

    /// Session seconds after which zero pointer movement is suspicious
    pub idle_pointer_after_secs: f64,

    /// Session seconds after which zero keystrokes are suspicious
    pub idle_keyboard_after_secs: f64,

    /// Sessions shorter than this with many page views are suspicious
    pub short_session_secs: f64,

    /// Page-view rate that makes a short session suspicious
    pub short_session_page_view_rate: f64,
}

impl Default for BehavioralConfig {
    fn default() -> Self {
        Self {
            max_request_rate: 60.0,
            max_page_view_rate: 2.0,
            idle_pointer_after_secs: 10.0,
            idle_keyboard_after_secs: 20.0,
            short_session_secs: 5.0,
            short_session_page_view_rate: 1.0,
        }
    }
}

/// Tier routing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Score bands that bypass the traffic split, highest first
    pub bands: Vec<ScoreBand>,

    /// Capacity of the background ledger queue
    pub ledger_queue_capacity: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            bands: vec![
                ScoreBand {
                    min_score: 80,
                    tier: Tier::C,
                },
                ScoreBand {
                    min_score: 50,
                    tier: Tier::B,
                },
            ],
            ledger_queue_capacity: 10_000,
        }
    }
}

/// Scores at or above `min_score` go to `tier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBand {
    pub min_score: u8,
    pub tier: Tier,
}

/// Request-rate guard settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateGuardConfig {
    /// Enable the engine-level guard
    pub enabled: bool,

    /// Window length in seconds
    pub window_secs: u64,

    /// Maximum admitted calls per key per window
    pub max_requests: u32,

    /// How the key is derived from a request
    pub key_strategy: KeyStrategy,

    /// Interval between background sweeps of expired windows
    pub sweep_interval_secs: u64,
}

impl Default for RateGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 60,
            max_requests: 20,
            key_strategy: KeyStrategy::IpUserAgent,
            sweep_interval_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.classifier.thresholds.monitor, 30);
        assert_eq!(config.classifier.thresholds.block, 80);
        assert!(config.classifier.header_signals);
        assert_eq!(config.routing.bands.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.classifier.thresholds.challenge, config.classifier.thresholds.challenge);
        assert_eq!(parsed.routing.bands, config.routing.bands);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
routing:
  bands:
    - min_score: 70
      tier: a
rate_guard:
  max_requests: 5
  key_strategy: client_ip
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.routing.bands, vec![ScoreBand { min_score: 70, tier: Tier::A }]);
        assert_eq!(config.rate_guard.max_requests, 5);
        assert_eq!(config.rate_guard.window_secs, 60);
        assert_eq!(config.rate_guard.key_strategy, KeyStrategy::ClientIp);
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut config = EngineConfig::default();
        config.classifier.thresholds.challenge = 90;
        assert!(matches!(config.validate(), Err(ConfigError::Thresholds { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let mut config = EngineConfig::default();
        config.rate_guard.window_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::RateWindow));
    }

    #[test]
    fn test_validate_rejects_huge_window() {
        let mut config = EngineConfig::default();
        config.rate_guard.window_secs = u64::MAX;
        assert_eq!(config.validate(), Err(ConfigError::RateWindow));

        config.rate_guard.window_secs = MAX_WINDOW_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_cidr() {
        let mut config = EngineConfig::default();
        config.classifier.network.datacenter_ranges.push("not-a-range".to_string());
        assert_eq!(config.validate(), Err(ConfigError::Cidr("not-a-range".to_string())));
    }
}
