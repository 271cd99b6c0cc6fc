//! Bot score calculation and types.

use crate::config::{ClassifierConfig, ConfigError, RecommendationThresholds};
use crate::signals::{
    BehavioralRule, HeaderRule, KnownAgentList, NetworkRule, RequestContext, SignalRule,
    UserAgentRule,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// What the caller should do with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Allow,
    Monitor,
    Challenge,
    Block,
}

impl Recommendation {
    /// Map a score to a recommendation. Known good agents are always allowed.
    pub fn from_score(score: u8, known_good: bool, thresholds: &RecommendationThresholds) -> Self {
        if known_good {
            Recommendation::Allow
        } else if score >= thresholds.block {
            Recommendation::Block
        } else if score >= thresholds.challenge {
            Recommendation::Challenge
        } else if score >= thresholds.monitor {
            Recommendation::Monitor
        } else {
            Recommendation::Allow
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Allow => "ALLOW",
            Recommendation::Monitor => "MONITOR",
            Recommendation::Challenge => "CHALLENGE",
            Recommendation::Block => "BLOCK",
        }
    }
}

/// Map the number of fired signal groups to a confidence percentage.
pub fn confidence_for(groups_fired: usize) -> u8 {
    match groups_fired {
        0 => 30,
        1 => 50,
        2 => 65,
        3 => 80,
        _ => 95,
    }
}

/// Penalty contributed by one signal group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPenalty {
    pub group: String,
    pub penalty: u8,
    pub cap: u8,
}

/// Per-group contributions, in evaluation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalBreakdown {
    pub groups: Vec<GroupPenalty>,
}

impl SignalBreakdown {
    /// Penalty for a named group, if it was evaluated.
    pub fn penalty(&self, group: &str) -> Option<u8> {
        self.groups
            .iter()
            .find(|g| g.group == group)
            .map(|g| g.penalty)
    }

    /// Number of groups with a non-zero penalty.
    pub fn fired(&self) -> usize {
        self.groups.iter().filter(|g| g.penalty > 0).count()
    }
}

/// Classification of a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Bot probability (0-100)
    /// 0 = definitely human, 100 = definitely bot
    pub score: u8,

    /// Confidence in the score (0-100), from the number of corroborating groups
    pub confidence: u8,

    /// Whether the agent is a recognised crawler or monitor
    pub is_known_good_agent: bool,

    /// Matched known-agent signature
    pub known_agent: Option<String>,

    /// Score at or above the challenge threshold
    pub is_bot: bool,

    /// Triggered rule descriptions, in evaluation order
    pub signals: Vec<String>,

    /// Recommended action
    pub recommendation: Recommendation,

    /// Individual group contributions
    pub breakdown: SignalBreakdown,
}

/// Combines signal rules into a score, confidence and recommendation.
///
/// Stateless per call and safe to share across threads.
pub struct Classifier {
    rules: Vec<Arc<dyn SignalRule>>,
    known_agents: KnownAgentList,
    thresholds: RecommendationThresholds,
}

impl Classifier {
    /// Build the classifier with the enabled signal groups.
    pub fn new(config: &ClassifierConfig) -> Result<Self, ConfigError> {
        let mut rules: Vec<Arc<dyn SignalRule>> = Vec::with_capacity(4);
        if config.user_agent_signals {
            rules.push(Arc::new(UserAgentRule::new(&config.user_agent)));
        }
        if config.network_signals {
            rules.push(Arc::new(NetworkRule::new(&config.network)?));
        }
        if config.header_signals {
            rules.push(Arc::new(HeaderRule::new(&config.headers)));
        }
        if config.behavioral_signals {
            rules.push(Arc::new(BehavioralRule::new(&config.behavioral)));
        }

        Ok(Self::with_rules(
            rules,
            KnownAgentList::new(&config.known_good_agents),
            config.thresholds.clone(),
        ))
    }

    /// Build a classifier from arbitrary rules.
    pub fn with_rules(
        rules: Vec<Arc<dyn SignalRule>>,
        known_agents: KnownAgentList,
        thresholds: RecommendationThresholds,
    ) -> Self {
        Self {
            rules,
            known_agents,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &RecommendationThresholds {
        &self.thresholds
    }

    /// Classify a request. Never fails.
    pub fn classify(&self, ctx: &RequestContext) -> ClassificationResult {
        let mut breakdown = SignalBreakdown::default();
        let mut signals = Vec::new();
        let mut total: u32 = 0;

        for rule in &self.rules {
            let cap = rule.cap();
            let result = rule.evaluate(ctx);
            let penalty = result.penalty.min(cap);

            debug!(
                group = rule.name(),
                penalty,
                reasons = ?result.reasons,
                "Signal group evaluated"
            );

            total += u32::from(penalty);
            signals.extend(result.reasons);
            breakdown.groups.push(GroupPenalty {
                group: rule.name().to_string(),
                penalty,
                cap,
            });
        }

        let score = total.min(100) as u8;
        let known_agent = self.known_agents.matched(ctx.user_agent()).map(str::to_string);
        let is_known_good_agent = known_agent.is_some();

        ClassificationResult {
            score,
            confidence: confidence_for(breakdown.fired()),
            is_known_good_agent,
            known_agent,
            is_bot: score >= self.thresholds.challenge,
            signals,
            recommendation: Recommendation::from_score(score, is_known_good_agent, &self.thresholds),
            breakdown,
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        // Default datacenter ranges are static and valid.
        Self::new(&ClassifierConfig::default()).unwrap_or_else(|_| {
            Self::with_rules(
                vec![
                    Arc::new(UserAgentRule::default()),
                    Arc::new(HeaderRule::default()),
                    Arc::new(BehavioralRule::default()),
                ],
                KnownAgentList::default(),
                RecommendationThresholds::default(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{BehaviorSnapshot, ScrollPattern, SignalResult};

    const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    fn browser_request() -> RequestContext {
        RequestContext::new(Some(CHROME), Some("81.2.69.160"))
            .with_header("accept", "text/html,application/xhtml+xml")
            .with_header("accept-language", "en-US")
            .with_header("accept-encoding", "gzip")
    }

    #[test]
    fn test_recommendation_thresholds() {
        let t = RecommendationThresholds::default();
        assert_eq!(Recommendation::from_score(0, false, &t), Recommendation::Allow);
        assert_eq!(Recommendation::from_score(29, false, &t), Recommendation::Allow);
        assert_eq!(Recommendation::from_score(30, false, &t), Recommendation::Monitor);
        assert_eq!(Recommendation::from_score(49, false, &t), Recommendation::Monitor);
        assert_eq!(Recommendation::from_score(50, false, &t), Recommendation::Challenge);
        assert_eq!(Recommendation::from_score(79, false, &t), Recommendation::Challenge);
        assert_eq!(Recommendation::from_score(80, false, &t), Recommendation::Block);
        assert_eq!(Recommendation::from_score(100, true, &t), Recommendation::Allow);
    }

    #[test]
    fn test_recommendation_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Recommendation::Challenge).unwrap(), "\"CHALLENGE\"");
        assert_eq!(Recommendation::Block.as_str(), "BLOCK");
    }

    #[test]
    fn test_confidence_steps() {
        assert_eq!(confidence_for(0), 30);
        assert_eq!(confidence_for(1), 50);
        assert_eq!(confidence_for(2), 65);
        assert_eq!(confidence_for(3), 80);
        assert_eq!(confidence_for(4), 95);
        assert_eq!(confidence_for(9), 95);
    }

    #[test]
    fn test_clean_browser() {
        let result = Classifier::default().classify(&browser_request());
        assert_eq!(result.score, 0);
        assert_eq!(result.confidence, 30);
        assert_eq!(result.recommendation, Recommendation::Allow);
        assert!(result.signals.is_empty());
        assert_eq!(result.breakdown.groups.len(), 4);
    }

    #[test]
    fn test_empty_request_is_suspicious() {
        let result = Classifier::default().classify(&RequestContext::default());
        // user agent 30 + network 20 + headers 10
        assert_eq!(result.score, 60);
        assert_eq!(result.confidence, 80);
        assert_eq!(result.recommendation, Recommendation::Challenge);
        assert!(result.is_bot);
    }

    #[test]
    fn test_scripted_client_blocked() {
        let ctx = RequestContext::new(Some("python-requests/2.31.0"), Some("52.1.2.3"))
            .with_header("accept", "*/*")
            .with_header("x-forwarded-for", "10.0.0.1")
            .with_behavior(BehaviorSnapshot {
                pointer_movements: Some(0),
                keystrokes: Some(0),
                request_rate: Some(200.0),
                session_duration: Some(60.0),
                scroll_pattern: Some(ScrollPattern::Linear),
                ..Default::default()
            });
        let result = Classifier::default().classify(&ctx);
        // 25 + 15 + 20 + 30
        assert_eq!(result.score, 90);
        assert_eq!(result.confidence, 95);
        assert_eq!(result.recommendation, Recommendation::Block);
        assert_eq!(result.breakdown.penalty("headers"), Some(20));
    }

    #[test]
    fn test_known_good_agent_allowed() {
        let ctx = RequestContext::new(Some("Googlebot/2.1 (+http://www.google.com/bot.html)"), None);
        let result = Classifier::default().classify(&ctx);
        assert!(result.is_known_good_agent);
        assert_eq!(result.known_agent.as_deref(), Some("googlebot"));
        assert!(result.score >= 30);
        assert_eq!(result.recommendation, Recommendation::Allow);
    }

    #[test]
    fn test_disabled_groups_are_skipped() {
        let config = ClassifierConfig {
            network_signals: false,
            behavioral_signals: false,
            ..Default::default()
        };
        let classifier = Classifier::new(&config).unwrap();
        let result = classifier.classify(&RequestContext::default());
        assert_eq!(result.breakdown.groups.len(), 2);
        assert_eq!(result.breakdown.penalty("network"), None);
        assert_eq!(result.score, 40);
    }

    struct Overshoot;

    impl SignalRule for Overshoot {
        fn evaluate(&self, _ctx: &RequestContext) -> SignalResult {
            SignalResult::new(200).with_reason("overshoot")
        }

        fn cap(&self) -> u8 {
            70
        }

        fn name(&self) -> &'static str {
            "overshoot"
        }
    }

    #[test]
    fn test_custom_rules_are_capped_and_clamped() {
        let classifier = Classifier::with_rules(
            vec![Arc::new(Overshoot), Arc::new(Overshoot)],
            KnownAgentList::default(),
            RecommendationThresholds::default(),
        );
        let result = classifier.classify(&RequestContext::default());
        assert_eq!(result.breakdown.penalty("overshoot"), Some(70));
        assert_eq!(result.score, 100);
        assert_eq!(result.confidence, 65);
    }
}
