//! Domain registry.
//!
//! Supplies per-domain routing configuration and absorbs counter
//! increments. Readers always see a whole configuration: updates replace
//! the shared snapshot instead of editing it in place.

use crate::config::{ConfigError, MAX_WINDOW_SECS};
use crate::router::{Tier, TierSplit};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Operating status of a domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStatus {
    #[default]
    Active,
    Paused,
    Maintenance,
}

impl DomainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainStatus::Active => "active",
            DomainStatus::Paused => "paused",
            DomainStatus::Maintenance => "maintenance",
        }
    }
}

impl std::fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend origin for each tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBackends {
    pub a: String,
    pub b: String,
    pub c: String,
}

impl TierBackends {
    pub fn get(&self, tier: Tier) -> &str {
        match tier {
            Tier::A => &self.a,
            Tier::B => &self.b,
            Tier::C => &self.c,
        }
    }
}

/// Per-domain request-rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainRateLimit {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_secs: u64,
}

impl Default for DomainRateLimit {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 1000,
            window_secs: 3600,
        }
    }
}

/// Running counters at the time of a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainCounters {
    pub total_requests: u64,
    pub total_bot_blocks: u64,
}

/// Counter that can be incremented through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterField {
    TotalRequests,
    TotalBotBlocks,
}

/// Configuration of one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Domain name (unique key)
    pub name: String,

    #[serde(default)]
    pub status: DomainStatus,

    pub backends: TierBackends,

    #[serde(default)]
    pub split: TierSplit,

    #[serde(default)]
    pub rate_limit: DomainRateLimit,

    /// Filled in by the registry on read
    #[serde(default)]
    pub counters: DomainCounters,
}

impl DomainConfig {
    /// Create an active domain with the default split.
    pub fn new(name: impl Into<String>, a: &str, b: &str, c: &str) -> Self {
        Self {
            name: name.into(),
            status: DomainStatus::Active,
            backends: TierBackends {
                a: a.to_string(),
                b: b.to_string(),
                c: c.to_string(),
            },
            split: TierSplit::default(),
            rate_limit: DomainRateLimit::default(),
            counters: DomainCounters::default(),
        }
    }

    pub fn with_split(mut self, split: TierSplit) -> Self {
        self.split = split;
        self
    }

    pub fn with_status(mut self, status: DomainStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: DomainRateLimit) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == DomainStatus::Active
    }

    pub fn backend(&self, tier: Tier) -> &str {
        self.backends.get(tier)
    }

    /// Check name, backend addresses and split.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::DomainName);
        }
        for tier in Tier::ALL {
            let address = self.backend(tier);
            if !(address.starts_with("http://") || address.starts_with("https://")) {
                return Err(ConfigError::Backend {
                    tier: tier.as_str(),
                    address: address.to_string(),
                });
            }
        }
        if self.rate_limit.enabled
            && (self.rate_limit.max_requests == 0
                || !(1..=MAX_WINDOW_SECS).contains(&self.rate_limit.window_secs))
        {
            return Err(ConfigError::RateWindow);
        }
        self.split.validate()
    }
}

/// Read/update contract the engine needs from domain storage.
#[async_trait]
pub trait DomainRegistry: Send + Sync {
    /// Consistent snapshot of a domain's configuration.
    async fn get(&self, domain: &str) -> Option<DomainConfig>;

    /// Add to counters. Unknown domains are ignored.
    async fn increment_counters(&self, domain: &str, deltas: &[(CounterField, u64)]);
}

struct DomainSlot {
    config: Arc<DomainConfig>,
    total_requests: Arc<AtomicU64>,
    total_bot_blocks: Arc<AtomicU64>,
}

/// In-memory registry.
#[derive(Default)]
pub struct InMemoryDomainRegistry {
    domains: DashMap<String, DomainSlot>,
}

/// Registry key for a domain name: trimmed, lowercased, no trailing dot.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_lowercase()
}

impl InMemoryDomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON or YAML list of domains.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let domains: Vec<DomainConfig> =
            if path.extension().is_some_and(|e| e == "yaml" || e == "yml") {
                serde_yaml::from_str(&content)?
            } else {
                serde_json::from_str(&content)?
            };

        let registry = Self::new();
        for domain in domains {
            registry.upsert(domain)?;
        }
        info!(domains = registry.len(), path = %path.display(), "Domain registry loaded");
        Ok(registry)
    }

    /// Insert or replace a domain. Counters survive replacement.
    pub fn upsert(&self, mut config: DomainConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let key = normalize_domain(&config.name);
        config.counters = DomainCounters::default();

        match self.domains.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                slot.get_mut().config = Arc::new(config);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(DomainSlot {
                    config: Arc::new(config),
                    total_requests: Arc::new(AtomicU64::new(0)),
                    total_bot_blocks: Arc::new(AtomicU64::new(0)),
                });
            }
        }
        Ok(())
    }

    /// Change the operating status. Returns false for unknown domains.
    pub fn set_status(&self, domain: &str, status: DomainStatus) -> bool {
        let Some(mut slot) = self.domains.get_mut(&normalize_domain(domain)) else {
            return false;
        };
        let mut next = (*slot.config).clone();
        next.status = status;
        slot.config = Arc::new(next);
        debug!(domain, status = %status, "Domain status changed");
        true
    }

    pub fn remove(&self, domain: &str) -> bool {
        self.domains.remove(&normalize_domain(domain)).is_some()
    }

    pub fn counters(&self, domain: &str) -> Option<DomainCounters> {
        self.domains.get(&normalize_domain(domain)).map(|slot| DomainCounters {
            total_requests: slot.total_requests.load(Ordering::Relaxed),
            total_bot_blocks: slot.total_bot_blocks.load(Ordering::Relaxed),
        })
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[async_trait]
impl DomainRegistry for InMemoryDomainRegistry {
    async fn get(&self, domain: &str) -> Option<DomainConfig> {
        let (config, total_requests, total_bot_blocks) = {
            let slot = self.domains.get(&normalize_domain(domain))?;
            (
                Arc::clone(&slot.config),
                Arc::clone(&slot.total_requests),
                Arc::clone(&slot.total_bot_blocks),
            )
        };

        let mut snapshot = (*config).clone();
        snapshot.counters = DomainCounters {
            total_requests: total_requests.load(Ordering::Relaxed),
            total_bot_blocks: total_bot_blocks.load(Ordering::Relaxed),
        };
        Some(snapshot)
    }

    async fn increment_counters(&self, domain: &str, deltas: &[(CounterField, u64)]) {
        let Some(slot) = self.domains.get(&normalize_domain(domain)) else {
            debug!(domain, "Counter increment for unknown domain ignored");
            return;
        };
        for (field, delta) in deltas {
            let counter = match field {
                CounterField::TotalRequests => &slot.total_requests,
                CounterField::TotalBotBlocks => &slot.total_bot_blocks,
            };
            counter.fetch_add(*delta, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> DomainConfig {
        DomainConfig::new(
            "Example.com",
            "https://a.example.net",
            "https://b.example.net",
            "https://c.example.net",
        )
    }

    #[tokio::test]
    async fn test_get_is_case_insensitive() {
        let registry = InMemoryDomainRegistry::new();
        registry.upsert(example()).unwrap();
        let config = registry.get("example.COM").await.unwrap();
        assert_eq!(config.backend(Tier::B), "https://b.example.net");
        assert!(registry.get("other.com").await.is_none());
    }

    #[tokio::test]
    async fn test_counters() {
        let registry = InMemoryDomainRegistry::new();
        registry.upsert(example()).unwrap();
        registry
            .increment_counters(
                "example.com",
                &[(CounterField::TotalRequests, 3), (CounterField::TotalBotBlocks, 1)],
            )
            .await;
        registry
            .increment_counters("example.com", &[(CounterField::TotalRequests, 1)])
            .await;

        let config = registry.get("example.com").await.unwrap();
        assert_eq!(config.counters.total_requests, 4);
        assert_eq!(config.counters.total_bot_blocks, 1);
    }

    #[tokio::test]
    async fn test_upsert_keeps_counters() {
        let registry = InMemoryDomainRegistry::new();
        registry.upsert(example()).unwrap();
        registry
            .increment_counters("example.com", &[(CounterField::TotalRequests, 7)])
            .await;
        registry
            .upsert(example().with_split(TierSplit::new(50.0, 25.0, 25.0)))
            .unwrap();

        let config = registry.get("example.com").await.unwrap();
        assert_eq!(config.split, TierSplit::new(50.0, 25.0, 25.0));
        assert_eq!(config.counters.total_requests, 7);
    }

    #[tokio::test]
    async fn test_set_status() {
        let registry = InMemoryDomainRegistry::new();
        registry.upsert(example()).unwrap();
        assert!(registry.set_status("example.com", DomainStatus::Paused));
        assert!(!registry.set_status("missing.com", DomainStatus::Paused));
        let config = registry.get("example.com").await.unwrap();
        assert!(!config.is_active());
    }

    #[test]
    fn test_validation() {
        let mut bad = example();
        bad.backends.c = "ftp://c.example.net".to_string();
        assert!(matches!(bad.validate(), Err(ConfigError::Backend { tier: "tier_c", .. })));

        let bad = example().with_split(TierSplit::new(70.0, 20.0, 5.0));
        assert!(matches!(bad.validate(), Err(ConfigError::TrafficSplit(_))));

        let mut bad = example();
        bad.name = " ".to_string();
        assert_eq!(bad.validate(), Err(ConfigError::DomainName));

        let mut bad = example();
        bad.rate_limit.window_secs = u64::MAX;
        assert_eq!(bad.validate(), Err(ConfigError::RateWindow));
        bad.rate_limit.enabled = false;
        assert!(bad.validate().is_ok());
    }

    #[test]
    fn test_domain_yaml() {
        let yaml = r#"
- name: shop.example.com
  status: paused
  backends:
    a: https://clean.internal
    b: https://gray.internal
    c: https://aggressive.internal
  split: { a: 60, b: 30, c: 10 }
"#;
        let domains: Vec<DomainConfig> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(domains[0].status, DomainStatus::Paused);
        assert_eq!(domains[0].split, TierSplit::new(60.0, 30.0, 10.0));
        assert!(domains[0].rate_limit.enabled);
    }
}
