//! Tier routing.
//!
//! Scores at or above a configured band go straight to that band's tier.
//! Everything else is spread over the domain's traffic split by a uniform
//! draw in `[0, 100)`.

use crate::config::{ConfigError, RoutingConfig, ScoreBand};
use crate::ledger::{LedgerHandle, TrafficRecord};
use crate::registry::{CounterField, DomainConfig, DomainRegistry, DomainStatus};
use crate::score::{ClassificationResult, Recommendation};
use crate::signals::ClientContext;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Tolerance when checking that a split totals 100%.
pub const SPLIT_TOLERANCE: f64 = 0.01;

/// Backend tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    A,
    B,
    C,
}

impl Tier {
    /// All tiers in split order.
    pub const ALL: [Tier; 3] = [Tier::A, Tier::B, Tier::C];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::A => "tier_a",
            Tier::B => "tier_b",
            Tier::C => "tier_c",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Percentage of split traffic each tier receives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierSplit {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl TierSplit {
    pub fn new(a: f64, b: f64, c: f64) -> Self {
        Self { a, b, c }
    }

    /// Percentages must be non-negative and total 100 within [`SPLIT_TOLERANCE`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let total = self.a + self.b + self.c;
        let parts_ok = [self.a, self.b, self.c]
            .iter()
            .all(|p| p.is_finite() && *p >= 0.0);
        if !parts_ok || (total - 100.0).abs() > SPLIT_TOLERANCE {
            return Err(ConfigError::TrafficSplit(total));
        }
        Ok(())
    }
}

impl Default for TierSplit {
    fn default() -> Self {
        Self::new(70.0, 20.0, 10.0)
    }
}

/// Pick the tier whose cumulative range contains `draw`.
///
/// Tier C takes whatever A and B leave, so it stays reachable even when
/// the percentages do not add up exactly.
pub fn select_by_split(split: &TierSplit, draw: f64) -> Tier {
    let mut cumulative = split.a.max(0.0);
    if draw < cumulative {
        return Tier::A;
    }
    cumulative += split.b.max(0.0);
    if draw < cumulative {
        return Tier::B;
    }
    Tier::C
}

/// Source of uniform draws in `[0, 100)`.
pub trait SplitSampler: Send + Sync {
    fn draw(&self) -> f64;
}

/// Draws from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngSampler;

impl SplitSampler for ThreadRngSampler {
    fn draw(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..100.0)
    }
}

/// Reproducible draws from a seeded RNG.
pub struct SeededSampler {
    rng: Mutex<StdRng>,
}

impl SeededSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl SplitSampler for SeededSampler {
    fn draw(&self) -> f64 {
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0.0..100.0),
            Err(poisoned) => poisoned.into_inner().gen_range(0.0..100.0),
        }
    }
}

/// Score bands checked before the traffic split.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingPolicy {
    bands: Vec<ScoreBand>,
}

impl RoutingPolicy {
    /// Bands are ordered highest threshold first.
    pub fn new(mut bands: Vec<ScoreBand>) -> Self {
        bands.sort_by(|x, y| y.min_score.cmp(&x.min_score));
        Self { bands }
    }

    pub fn from_config(config: &RoutingConfig) -> Self {
        Self::new(config.bands.clone())
    }

    /// First band whose threshold the score reaches.
    pub fn band_for(&self, score: u8) -> Option<ScoreBand> {
        self.bands.iter().find(|b| score >= b.min_score).copied()
    }

    pub fn bands(&self) -> &[ScoreBand] {
        &self.bands
    }
}

/// Outcome of routing one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub domain: String,
    pub tier: Tier,
    pub backend: String,
    pub reason: String,
    pub score: u8,
    pub recommendation: Recommendation,
    pub timestamp: DateTime<Utc>,
}

/// Routing failures. Both fail closed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteError {
    /// No configuration for the domain.
    #[error("domain '{domain}' not found")]
    DomainNotFound { domain: String },

    /// Domain is paused or in maintenance.
    #[error("domain '{domain}' is not active (status: {status})")]
    DomainUnavailable { domain: String, status: DomainStatus },
}

/// Selects a backend tier for classified requests.
pub struct TierRouter {
    registry: Arc<dyn DomainRegistry>,
    ledger: LedgerHandle,
    policy: RoutingPolicy,
    sampler: Arc<dyn SplitSampler>,
}

impl TierRouter {
    pub fn new(
        registry: Arc<dyn DomainRegistry>,
        ledger: LedgerHandle,
        policy: RoutingPolicy,
        sampler: Arc<dyn SplitSampler>,
    ) -> Self {
        Self {
            registry,
            ledger,
            policy,
            sampler,
        }
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    /// Route a classified request for `domain`.
    pub async fn route(
        &self,
        domain: &str,
        classification: &ClassificationResult,
        client: &ClientContext,
    ) -> Result<RoutingDecision, RouteError> {
        let config = self.registry.get(domain).await;
        self.route_with_config(domain, config, classification, client)
            .await
    }

    /// Route against a configuration snapshot the caller already read.
    pub async fn route_with_config(
        &self,
        domain: &str,
        config: Option<DomainConfig>,
        classification: &ClassificationResult,
        client: &ClientContext,
    ) -> Result<RoutingDecision, RouteError> {
        let Some(config) = config else {
            warn!(domain, "Routing rejected: domain not found");
            return Err(RouteError::DomainNotFound {
                domain: domain.to_string(),
            });
        };

        if !config.is_active() {
            warn!(domain, status = %config.status, "Routing rejected: domain not active");
            return Err(RouteError::DomainUnavailable {
                domain: domain.to_string(),
                status: config.status,
            });
        }

        let score = classification.score;
        let (tier, reason) = match self.policy.band_for(score) {
            Some(band) => (
                band.tier,
                format!("score {} at or above band {}", score, band.min_score),
            ),
            None => {
                let draw = self.sampler.draw();
                (
                    select_by_split(&config.split, draw),
                    format!("traffic split draw {:.2} (score {})", draw, score),
                )
            }
        };

        let decision = RoutingDecision {
            domain: config.name.clone(),
            tier,
            backend: config.backend(tier).to_string(),
            reason,
            score,
            recommendation: classification.recommendation,
            timestamp: Utc::now(),
        };

        let mut deltas = vec![(CounterField::TotalRequests, 1)];
        if classification.recommendation == Recommendation::Block {
            deltas.push((CounterField::TotalBotBlocks, 1));
        }
        self.registry.increment_counters(domain, &deltas).await;

        self.ledger.record(TrafficRecord {
            domain: decision.domain.clone(),
            client_ip: client.ip.clone(),
            user_agent: client.user_agent.clone(),
            method: client.method.clone(),
            path: client.path.clone(),
            fingerprint: client.fingerprint.clone(),
            tier,
            backend: decision.backend.clone(),
            score,
            is_bot: classification.is_bot,
            recommendation: classification.recommendation,
            reason: decision.reason.clone(),
            timestamp: decision.timestamp,
        });

        info!(
            domain = %decision.domain,
            client_ip = client.ip.as_deref().unwrap_or("-"),
            tier = tier.as_str(),
            bot_score = score,
            reason = %decision.reason,
            "Request routed"
        );

        Ok(decision)
    }
}
