//! Behavioral signals.
//!
//! Scores a telemetry snapshot aggregated upstream:
//! - Request and page-view rate
//! - Absent pointer or keyboard interaction
//! - Mechanical scrolling
//! - Short sessions with many page views

use super::{RequestContext, SignalResult, SignalRule};
use crate::config::BehavioralConfig;

const CAP: u8 = 30;
const HIGH_REQUEST_RATE_PENALTY: u8 = 15;
const RAPID_PAGE_VIEWS_PENALTY: u8 = 10;
const NO_POINTER_PENALTY: u8 = 15;
const NO_KEYBOARD_PENALTY: u8 = 10;
const MECHANICAL_SCROLL_PENALTY: u8 = 10;
const SHORT_SESSION_PENALTY: u8 = 15;

/// Behavioral rule.
pub struct BehavioralRule {
    config: BehavioralConfig,
}

impl BehavioralRule {
    /// Create a rule from configuration.
    pub fn new(config: &BehavioralConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl Default for BehavioralRule {
    fn default() -> Self {
        Self::new(&BehavioralConfig::default())
    }
}

impl SignalRule for BehavioralRule {
    fn evaluate(&self, ctx: &RequestContext) -> SignalResult {
        let Some(b) = ctx.behavior.as_ref() else {
            return SignalResult::clean();
        };

        if b.is_malformed() {
            return SignalResult::new(CAP).with_reason("malformed_behavior_snapshot");
        }

        let cfg = &self.config;
        let session = b.session_duration.unwrap_or(0.0);
        let mut result = SignalResult::clean();

        if let Some(rate) = b.request_rate.filter(|r| *r > cfg.max_request_rate) {
            result.add(HIGH_REQUEST_RATE_PENALTY, format!("high_request_rate_{:.0}", rate));
        }

        if let Some(rate) = b.page_view_rate.filter(|r| *r > cfg.max_page_view_rate) {
            result.add(RAPID_PAGE_VIEWS_PENALTY, format!("rapid_page_views_{:.1}", rate));
        }

        if b.pointer_movements == Some(0) && session > cfg.idle_pointer_after_secs {
            result.add(NO_POINTER_PENALTY, "no_pointer_movement");
        }

        if b.keystrokes == Some(0) && session > cfg.idle_keyboard_after_secs {
            result.add(NO_KEYBOARD_PENALTY, "no_keyboard_interaction");
        }

        if b.scroll_pattern.is_some_and(|p| p.is_mechanical()) {
            result.add(MECHANICAL_SCROLL_PENALTY, "mechanical_scroll_pattern");
        }

        if let (Some(duration), Some(pvr)) = (b.session_duration, b.page_view_rate) {
            if duration < cfg.short_session_secs && pvr > cfg.short_session_page_view_rate {
                result.add(SHORT_SESSION_PENALTY, "short_session_many_page_views");
            }
        }

        result.capped(CAP)
    }

    fn cap(&self) -> u8 {
        CAP
    }

    fn name(&self) -> &'static str {
        "behavioral"
    }
}
