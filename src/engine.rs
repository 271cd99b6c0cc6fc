//! Engine facade tying the rate guard, classifier and tier router together.

use crate::config::{ConfigError, EngineConfig};
use crate::ledger::LedgerHandle;
use crate::rate_guard::{rate_key, Admission, KeyStrategy, RateGuard};
use crate::registry::{normalize_domain, DomainConfig, DomainRateLimit, DomainRegistry};
use crate::router::{RouteError, RoutingDecision, RoutingPolicy, SplitSampler, TierRouter};
use crate::score::{ClassificationResult, Classifier};
use crate::signals::{BehaviorSnapshot, ClientContext, RequestContext};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One request submitted to the engine for a domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Submission {
    pub domain: String,
    #[serde(default)]
    pub request: RequestContext,
}

impl Submission {
    /// Parse one JSON submission. Never fails.
    ///
    /// When the request cannot be read as a whole, whatever string fields
    /// survive are kept and the behavior snapshot is marked malformed, so the
    /// request is still classified, conservatively.
    pub fn from_line(line: &str) -> Self {
        match serde_json::from_str::<Self>(line) {
            Ok(submission) => submission,
            Err(e) => {
                warn!(error = %e, "Unreadable submission, classifying conservatively");
                let value: serde_json::Value = serde_json::from_str(line).unwrap_or_default();
                let text = |v: &serde_json::Value, key: &str| {
                    v.get(key).and_then(|s| s.as_str()).map(str::to_string)
                };
                let request = value.get("request").cloned().unwrap_or_default();
                Self {
                    domain: text(&value, "domain").unwrap_or_default(),
                    request: RequestContext {
                        user_agent: text(&request, "user_agent"),
                        client_ip: text(&request, "client_ip"),
                        identity: text(&request, "identity"),
                        method: text(&request, "method"),
                        path: text(&request, "path"),
                        behavior: Some(BehaviorSnapshot::malformed()),
                        ..Default::default()
                    },
                }
            }
        }
    }
}

/// Result of [`Engine::handle`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Denied by the engine or domain rate guard. Not classified.
    Throttled { scope: GuardScope, admission: Admission },

    /// Classified and routed to a backend.
    Routed {
        admission: Option<Admission>,
        classification: ClassificationResult,
        decision: RoutingDecision,
    },

    /// Classified, but the domain refused routing.
    Rejected {
        classification: ClassificationResult,
        error: RouteError,
    },
}

impl Outcome {
    pub fn is_routed(&self) -> bool {
        matches!(self, Outcome::Routed { .. })
    }
}

/// Which guard produced a throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardScope {
    Engine,
    Domain,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct GuardLimits {
    max_requests: u32,
    window_secs: u64,
}

/// Classification and routing engine.
pub struct Engine {
    classifier: Classifier,
    router: TierRouter,
    registry: Arc<dyn DomainRegistry>,
    /// Engine-level guard, absent when disabled
    guard: Option<Arc<RateGuard>>,
    key_strategy: KeyStrategy,
    sweep_interval: Duration,
    /// Per-domain guards, created on first use
    domain_guards: DashMap<String, (GuardLimits, Arc<RateGuard>)>,
}

impl Engine {
    /// Build the engine. The configuration is validated first.
    pub fn new(
        config: &EngineConfig,
        registry: Arc<dyn DomainRegistry>,
        ledger: LedgerHandle,
        sampler: Arc<dyn SplitSampler>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let classifier = Classifier::new(&config.classifier)?;
        let policy = RoutingPolicy::from_config(&config.routing);
        let router = TierRouter::new(Arc::clone(&registry), ledger, policy, sampler);

        let guard = config.rate_guard.enabled.then(|| {
            Arc::new(RateGuard::new(
                config.rate_guard.max_requests,
                Duration::from_secs(config.rate_guard.window_secs),
            ))
        });

        info!(
            rate_guard = config.rate_guard.enabled,
            max_requests = config.rate_guard.max_requests,
            window_secs = config.rate_guard.window_secs,
            bands = config.routing.bands.len(),
            "Engine initialized"
        );

        Ok(Self {
            classifier,
            router,
            registry,
            guard,
            key_strategy: config.rate_guard.key_strategy,
            sweep_interval: Duration::from_secs(config.rate_guard.sweep_interval_secs),
            domain_guards: DashMap::new(),
        })
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn router(&self) -> &TierRouter {
        &self.router
    }

    /// Engine-level guard, if enabled.
    pub fn rate_guard(&self) -> Option<&Arc<RateGuard>> {
        self.guard.as_ref()
    }

    /// Score a request.
    pub fn classify(&self, ctx: &RequestContext) -> ClassificationResult {
        self.classifier.classify(ctx)
    }

    /// Route a classified request.
    pub async fn route(
        &self,
        domain: &str,
        classification: &ClassificationResult,
        client: &ClientContext,
    ) -> Result<RoutingDecision, RouteError> {
        self.router.route(domain, classification, client).await
    }

    /// Count the request against the engine guard without classifying it.
    pub fn admit(&self, ctx: &RequestContext) -> Option<Admission> {
        let guard = self.guard.as_ref()?;
        Some(guard.admit(&rate_key(self.key_strategy, ctx)))
    }

    /// Guard, classify and route one request.
    pub async fn handle(&self, domain: &str, ctx: &RequestContext) -> Outcome {
        let admission = self.admit(ctx);
        if let Some(admission) = admission.as_ref().filter(|a| !a.allowed) {
            warn!(
                domain,
                client_ip = ctx.client_ip.as_deref().unwrap_or("-"),
                reset_in_secs = admission.reset_in.as_secs(),
                "Request throttled by engine guard"
            );
            return Outcome::Throttled {
                scope: GuardScope::Engine,
                admission: admission.clone(),
            };
        }

        // One snapshot serves both the domain guard and the routing decision
        let config = self.registry.get(domain).await;

        if let Some(domain_admission) = self.admit_domain(domain, config.as_ref(), ctx) {
            if !domain_admission.allowed {
                warn!(
                    domain,
                    client_ip = ctx.client_ip.as_deref().unwrap_or("-"),
                    "Request throttled by domain guard"
                );
                return Outcome::Throttled {
                    scope: GuardScope::Domain,
                    admission: domain_admission,
                };
            }
        }

        let classification = self.classify(ctx);
        let routed = self
            .router
            .route_with_config(domain, config, &classification, &ctx.client())
            .await;
        match routed {
            Ok(decision) => Outcome::Routed {
                admission,
                classification,
                decision,
            },
            Err(error) => Outcome::Rejected {
                classification,
                error,
            },
        }
    }

    /// Count the request against the domain's own limit, if it has one.
    ///
    /// Unknown domains skip this guard and fail later in routing; any guard
    /// left over from a removed domain is dropped.
    fn admit_domain(
        &self,
        domain: &str,
        config: Option<&DomainConfig>,
        ctx: &RequestContext,
    ) -> Option<Admission> {
        let key = normalize_domain(domain);
        let Some(config) = config else {
            if self.domain_guards.remove(&key).is_some() {
                debug!(domain, "Domain gone, dropping its rate guard");
            }
            return None;
        };
        let guard = self.domain_guard(&key, &config.rate_limit)?;
        Some(guard.admit(&rate_key(self.key_strategy, ctx)))
    }

    /// Guard for a domain, rebuilt when its limits change.
    fn domain_guard(&self, domain: &str, limit: &DomainRateLimit) -> Option<Arc<RateGuard>> {
        if !limit.enabled || limit.max_requests == 0 || limit.window_secs == 0 {
            self.domain_guards.remove(domain);
            return None;
        }

        let limits = GuardLimits {
            max_requests: limit.max_requests,
            window_secs: limit.window_secs,
        };

        let mut entry = self
            .domain_guards
            .entry(domain.to_string())
            .or_insert_with(|| (limits, Self::build_guard(limits)));
        if entry.0 != limits {
            debug!(domain, "Domain rate limit changed, resetting guard");
            *entry = (limits, Self::build_guard(limits));
        }
        Some(Arc::clone(&entry.1))
    }

    fn build_guard(limits: GuardLimits) -> Arc<RateGuard> {
        Arc::new(RateGuard::new(
            limits.max_requests,
            Duration::from_secs(limits.window_secs),
        ))
    }

    /// Sweep expired windows from every guard.
    pub fn sweep(&self) -> usize {
        let mut removed = self.guard.as_ref().map_or(0, |g| g.sweep());
        for entry in self.domain_guards.iter() {
            removed += entry.value().1.sweep();
        }
        removed
    }

    /// Periodically sweep every guard until the engine is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        let interval = self.sweep_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match engine.upgrade() {
                    Some(engine) => {
                        let removed = engine.sweep();
                        debug!(removed, "Engine sweep complete");
                    }
                    None => break,
                }
            }
        })
    }
}
