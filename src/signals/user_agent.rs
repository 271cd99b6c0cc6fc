//! User-Agent signals.
//!
//! The first matching check decides the penalty:
//! - Missing or very short agent
//! - Automation tool signature
//! - Unusual length
//! - No browser engine marker

use super::{reason_fragment, RequestContext, SignalResult, SignalRule};
use crate::config::UserAgentConfig;

const CAP: u8 = 30;
const MISSING_PENALTY: u8 = 30;
const AUTOMATION_PENALTY: u8 = 25;
const UNUSUAL_LENGTH_PENALTY: u8 = 15;
const NO_BROWSER_MARKER_PENALTY: u8 = 20;

/// User-Agent rule.
pub struct UserAgentRule {
    min_length: usize,
    usual_length: std::ops::RangeInclusive<usize>,
    /// Lowercased automation signatures
    automation_signatures: Vec<String>,
    /// Lowercased browser markers
    browser_markers: Vec<String>,
}

impl UserAgentRule {
    /// Create a rule from configuration.
    pub fn new(config: &UserAgentConfig) -> Self {
        Self {
            min_length: config.min_length,
            usual_length: config.usual_min_length..=config.usual_max_length,
            automation_signatures: config
                .automation_signatures
                .iter()
                .map(|s| s.to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            browser_markers: config
                .browser_markers
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
        }
    }

    /// First automation signature contained in the agent.
    fn automation_signature(&self, ua_lower: &str) -> Option<&str> {
        self.automation_signatures
            .iter()
            .find(|sig| ua_lower.contains(sig.as_str()))
            .map(|s| s.as_str())
    }
}

impl Default for UserAgentRule {
    fn default() -> Self {
        Self::new(&UserAgentConfig::default())
    }
}

impl SignalRule for UserAgentRule {
    fn evaluate(&self, ctx: &RequestContext) -> SignalResult {
        let ua = ctx.user_agent().map(str::trim).unwrap_or("");
        let len = ua.chars().count();

        if len < self.min_length {
            let reason = if ua.is_empty() {
                "missing_user_agent"
            } else {
                "short_user_agent"
            };
            return SignalResult::new(MISSING_PENALTY).with_reason(reason);
        }

        let ua_lower = ua.to_lowercase();

        if let Some(sig) = self.automation_signature(&ua_lower) {
            return SignalResult::new(AUTOMATION_PENALTY)
                .with_reason(format!("automation_signature_{}", reason_fragment(sig)));
        }

        if !self.usual_length.contains(&len) {
            return SignalResult::new(UNUSUAL_LENGTH_PENALTY)
                .with_reason("unusual_user_agent_length");
        }

        if !self
            .browser_markers
            .iter()
            .any(|marker| ua_lower.contains(marker.as_str()))
        {
            return SignalResult::new(NO_BROWSER_MARKER_PENALTY)
                .with_reason("missing_browser_engine");
        }

        SignalResult::clean()
    }

    fn cap(&self) -> u8 {
        CAP
    }

    fn name(&self) -> &'static str {
        "user_agent"
    }
}
