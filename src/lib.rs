//! Bot classification and tier routing engine.
//!
//! Scores each request for bot likelihood from several independent signal
//! groups and routes it to one of three backend tiers for its domain.
//!
//! # Features
//!
//! - User-Agent, network origin, header and behavioral signal groups
//! - Known good agent allow-list (search engines, uptime monitors)
//! - Score bands and weighted traffic split per domain
//! - Keyed fixed-window request-rate guard, engine-wide and per domain
//! - Background traffic ledger that never blocks a routing decision
//!
//! # Example
//!
//! ```ignore
//! use tiergate::{Engine, EngineConfig, InMemoryDomainRegistry, LedgerWriter, MemoryLedger};
//! use tiergate::router::ThreadRngSampler;
//!
//! let (ledger, writer) = LedgerWriter::spawn(Arc::new(MemoryLedger::new()), 1024);
//! let engine = Engine::new(&config, Arc::new(registry), ledger, Arc::new(ThreadRngSampler))?;
//! let outcome = engine.handle("shop.example", &request).await;
//! ```

pub mod config;
pub mod engine;
pub mod ledger;
pub mod rate_guard;
pub mod registry;
pub mod router;
pub mod score;
pub mod signals;

pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, GuardScope, Outcome, Submission};
pub use ledger::{JsonLinesLedger, LedgerHandle, LedgerWriter, MemoryLedger, TrafficLedger};
pub use rate_guard::{Admission, KeyStrategy, RateGuard};
pub use registry::{DomainConfig, DomainRegistry, DomainStatus, InMemoryDomainRegistry};
pub use router::{RouteError, RoutingDecision, Tier, TierRouter, TierSplit};
pub use score::{ClassificationResult, Classifier, Recommendation, SignalBreakdown};
pub use signals::{BehaviorSnapshot, ClientContext, RequestContext};
