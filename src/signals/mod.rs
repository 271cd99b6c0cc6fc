//! Signal extractors.
//!
//! Each rule inspects one aspect of the request and returns a bounded
//! penalty with the reasons that produced it. Rules hold no mutable state
//! and perform no I/O.

pub mod behavioral;
pub mod headers;
pub mod known_agents;
pub mod network;
pub mod user_agent;

pub use behavioral::BehavioralRule;
pub use headers::HeaderRule;
pub use known_agents::KnownAgentList;
pub use network::{CidrDatacenterList, DatacenterLookup, NetworkRule};
pub use user_agent::UserAgentRule;

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

/// Everything the engine knows about one inbound request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestContext {
    /// Raw User-Agent, if the client sent one
    pub user_agent: Option<String>,
    /// Client IP as reported by the edge (may be absent or malformed)
    pub client_ip: Option<String>,
    /// Request headers
    pub headers: HashMap<String, Vec<String>>,
    /// Opaque client fingerprint token
    pub fingerprint: Option<String>,
    /// Behavioral telemetry snapshot
    #[serde(alias = "behaviorData", deserialize_with = "lenient_behavior")]
    pub behavior: Option<BehaviorSnapshot>,
    /// Authenticated identity or API key, if any
    pub identity: Option<String>,
    /// HTTP method
    pub method: Option<String>,
    /// Request path
    pub path: Option<String>,
}

impl RequestContext {
    /// Create a context for the given agent and IP.
    pub fn new(user_agent: Option<&str>, client_ip: Option<&str>) -> Self {
        Self {
            user_agent: user_agent.map(str::to_string),
            client_ip: client_ip.map(str::to_string),
            ..Default::default()
        }
    }

    /// Add a header value. The name is lowercased.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    /// Attach a behavioral snapshot.
    pub fn with_behavior(mut self, behavior: BehaviorSnapshot) -> Self {
        self.behavior = Some(behavior);
        self
    }

    /// Attach an authenticated identity.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// All values for a header. Names compare case-insensitively.
    fn header_values(&self, name: &str) -> Option<&Vec<String>> {
        self.headers.get(&name.to_lowercase()).or_else(|| {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }

    /// Get a single header value (first if multiple).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name)
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    /// Whether a header is present with a non-blank value.
    pub fn has_header(&self, name: &str) -> bool {
        self.header_values(name)
            .is_some_and(|v| v.iter().any(|s| !s.trim().is_empty()))
    }

    /// The User-Agent, falling back to the header map.
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent
            .as_deref()
            .or_else(|| self.header("user-agent"))
    }

    /// The client IP, if present and parsable.
    pub fn parsed_ip(&self) -> Option<IpAddr> {
        self.client_ip
            .as_deref()
            .and_then(|ip| ip.trim().parse().ok())
    }

    /// The subset of this request the router and ledger care about.
    pub fn client(&self) -> ClientContext {
        ClientContext {
            ip: self.client_ip.clone(),
            user_agent: self.user_agent().map(str::to_string),
            method: self.method.clone(),
            path: self.path.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

/// Client details carried into the routing decision and traffic record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub fingerprint: Option<String>,
}

/// Scroll behavior label produced by client-side telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollPattern {
    Natural,
    Linear,
    Instant,
    #[serde(other)]
    Unknown,
}

impl ScrollPattern {
    /// Linear and instant scrolling are produced by scripts, not hands.
    pub fn is_mechanical(&self) -> bool {
        matches!(self, ScrollPattern::Linear | ScrollPattern::Instant)
    }
}

/// Immutable behavioral features captured upstream for one request.
///
/// Every field is optional; an absent field never contributes a penalty.
/// Deserialization never fails on bad values: a negative or non-integral
/// counter, a non-numeric rate or a non-string scroll label is dropped and
/// the snapshot is flagged as malformed instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawBehaviorSnapshot")]
pub struct BehaviorSnapshot {
    /// Pointer movement events observed
    pub pointer_movements: Option<u64>,
    /// Keyboard events observed
    pub keystrokes: Option<u64>,
    /// Scroll events observed
    pub scroll_events: Option<u64>,
    /// Requests per minute
    pub request_rate: Option<f64>,
    /// Page views per second
    pub page_view_rate: Option<f64>,
    /// Session duration in seconds
    pub session_duration: Option<f64>,
    /// Scroll behavior label
    pub scroll_pattern: Option<ScrollPattern>,
    /// Upstream sent a value that could not be read
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub malformed: bool,
}

impl BehaviorSnapshot {
    /// A snapshot that could not be read at all.
    pub fn malformed() -> Self {
        Self {
            malformed: true,
            ..Default::default()
        }
    }

    /// A snapshot is malformed if upstream sent unreadable values, or any
    /// rate or duration is negative or not finite.
    pub fn is_malformed(&self) -> bool {
        self.malformed
            || [self.request_rate, self.page_view_rate, self.session_duration]
                .into_iter()
                .flatten()
                .any(|v| !v.is_finite() || v < 0.0)
    }
}

/// A snapshot that is not even an object still yields a (malformed) snapshot.
fn lenient_behavior<'de, D>(deserializer: D) -> Result<Option<BehaviorSnapshot>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.is_null()).map(|v| {
        serde_json::from_value(v).unwrap_or_else(|_| BehaviorSnapshot::malformed())
    }))
}

/// Wire form of [`BehaviorSnapshot`], accepting anything per field.
#[derive(Deserialize, Default)]
#[serde(default)]
struct RawBehaviorSnapshot {
    #[serde(alias = "mouseMovements")]
    pointer_movements: Option<serde_json::Value>,
    #[serde(alias = "keyboardEvents")]
    keystrokes: Option<serde_json::Value>,
    #[serde(alias = "scrollEvents")]
    scroll_events: Option<serde_json::Value>,
    #[serde(alias = "requestRate")]
    request_rate: Option<serde_json::Value>,
    #[serde(alias = "pageViewRate")]
    page_view_rate: Option<serde_json::Value>,
    #[serde(alias = "sessionDuration")]
    session_duration: Option<serde_json::Value>,
    #[serde(alias = "scrollPattern")]
    scroll_pattern: Option<serde_json::Value>,
    malformed: Option<serde_json::Value>,
}

impl From<RawBehaviorSnapshot> for BehaviorSnapshot {
    fn from(raw: RawBehaviorSnapshot) -> Self {
        let mut malformed = matches!(raw.malformed, Some(serde_json::Value::Bool(true)));

        let mut count = |v: Option<serde_json::Value>| -> Option<u64> {
            let v = v.filter(|v| !v.is_null())?;
            let n = v.as_u64().or_else(|| {
                v.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                    .map(|f| f as u64)
            });
            malformed |= n.is_none();
            n
        };
        let pointer_movements = count(raw.pointer_movements);
        let keystrokes = count(raw.keystrokes);
        let scroll_events = count(raw.scroll_events);

        let mut number = |v: Option<serde_json::Value>| -> Option<f64> {
            let v = v.filter(|v| !v.is_null())?;
            let n = v.as_f64();
            malformed |= n.is_none();
            n
        };
        let request_rate = number(raw.request_rate);
        let page_view_rate = number(raw.page_view_rate);
        let session_duration = number(raw.session_duration);

        let scroll_pattern = match raw.scroll_pattern.filter(|v| !v.is_null()) {
            None => None,
            Some(v) => match serde_json::from_value::<ScrollPattern>(v) {
                Ok(p) => Some(p),
                Err(_) => {
                    malformed = true;
                    None
                }
            },
        };

        Self {
            pointer_movements,
            keystrokes,
            scroll_events,
            request_rate,
            page_view_rate,
            session_duration,
            scroll_pattern,
            malformed,
        }
    }
}

/// Result from a single signal rule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalResult {
    /// Penalty contributed by this rule, already capped
    pub penalty: u8,
    /// Reasons for the penalty
    pub reasons: Vec<String>,
}

impl SignalResult {
    /// A result with no penalty.
    pub fn clean() -> Self {
        Self::default()
    }

    /// Create a result with a penalty.
    pub fn new(penalty: u8) -> Self {
        Self {
            penalty,
            reasons: vec![],
        }
    }

    /// Add a reason for the penalty.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reasons.push(reason.into());
        self
    }

    /// Add to the penalty and record why.
    pub fn add(&mut self, penalty: u8, reason: impl Into<String>) {
        self.penalty = self.penalty.saturating_add(penalty);
        self.reasons.push(reason.into());
    }

    /// Clamp the penalty to a group cap.
    pub fn capped(mut self, cap: u8) -> Self {
        self.penalty = self.penalty.min(cap);
        self
    }

    /// Whether this rule fired.
    pub fn fired(&self) -> bool {
        self.penalty > 0
    }
}

/// A pure `(RequestContext) -> (penalty, reasons)` rule.
pub trait SignalRule: Send + Sync {
    /// Evaluate the request. The returned penalty never exceeds [`SignalRule::cap`].
    fn evaluate(&self, ctx: &RequestContext) -> SignalResult;

    /// Maximum penalty this rule can contribute.
    fn cap(&self) -> u8;

    /// Rule name used in logs and the signal breakdown.
    fn name(&self) -> &'static str;
}

/// Normalize a header or signature into a reason-code fragment.
pub(crate) fn reason_fragment(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let ctx = RequestContext::default().with_header("Accept-Language", "en-US");
        assert_eq!(ctx.header("accept-language"), Some("en-US"));
        assert!(ctx.has_header("ACCEPT-LANGUAGE"));
        assert!(!ctx.has_header("accept"));

        let blank = RequestContext::default()
            .with_header("accept", "")
            .with_header("accept-language", "   ");
        assert!(!blank.has_header("accept"));
        assert!(!blank.has_header("accept-language"));

        let parsed: RequestContext =
            serde_json::from_str(r#"{"headers": {"X-Forwarded-For": ["10.0.0.1"]}}"#).unwrap();
        assert_eq!(parsed.header("x-forwarded-for"), Some("10.0.0.1"));
    }

    #[test]
    fn test_user_agent_falls_back_to_header() {
        let ctx = RequestContext::default().with_header("User-Agent", "curl/8.0");
        assert_eq!(ctx.user_agent(), Some("curl/8.0"));
    }

    #[test]
    fn test_parsed_ip() {
        assert!(RequestContext::new(None, Some("10.0.0.1")).parsed_ip().is_some());
        assert!(RequestContext::new(None, Some("not-an-ip")).parsed_ip().is_none());
        assert!(RequestContext::new(None, None).parsed_ip().is_none());
    }

    #[test]
    fn test_behavior_accepts_camel_case() {
        let json = r#"{"mouseMovements": 0, "sessionDuration": 30.5, "scrollPattern": "linear"}"#;
        let snapshot: BehaviorSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.pointer_movements, Some(0));
        assert_eq!(snapshot.session_duration, Some(30.5));
        assert_eq!(snapshot.scroll_pattern, Some(ScrollPattern::Linear));
    }

    #[test]
    fn test_unknown_scroll_pattern() {
        let snapshot: BehaviorSnapshot =
            serde_json::from_str(r#"{"scroll_pattern": "zigzag"}"#).unwrap();
        assert_eq!(snapshot.scroll_pattern, Some(ScrollPattern::Unknown));
    }

    #[test]
    fn test_malformed_snapshot() {
        let snapshot = BehaviorSnapshot {
            request_rate: Some(-1.0),
            ..Default::default()
        };
        assert!(snapshot.is_malformed());
        assert!(!BehaviorSnapshot::default().is_malformed());
        assert!(BehaviorSnapshot::malformed().is_malformed());
    }

    #[test]
    fn test_unreadable_telemetry_is_flagged() {
        for body in [
            r#"{"mouseMovements": -1}"#,
            r#"{"keyboardEvents": 2.5}"#,
            r#"{"scrollEvents": "many"}"#,
            r#"{"requestRate": "fast"}"#,
            r#"{"pageViewRate": "NaN"}"#,
            r#"{"sessionDuration": [30]}"#,
            r#"{"scrollPattern": 7}"#,
        ] {
            let snapshot: BehaviorSnapshot = serde_json::from_str(body).unwrap();
            assert!(snapshot.is_malformed(), "{} should be malformed", body);
        }
    }

    #[test]
    fn test_unreadable_behavior_keeps_request() {
        let ctx: RequestContext = serde_json::from_str(
            r#"{"user_agent": "curl/8.0", "behaviorData": {"mouseMovements": -1, "sessionDuration": 30}}"#,
        )
        .unwrap();
        assert_eq!(ctx.user_agent(), Some("curl/8.0"));
        assert!(ctx.behavior.as_ref().is_some_and(|b| b.is_malformed()));

        let ctx: RequestContext =
            serde_json::from_str(r#"{"behaviorData": "not telemetry"}"#).unwrap();
        assert_eq!(ctx.behavior, Some(BehaviorSnapshot::malformed()));

        let ctx: RequestContext = serde_json::from_str(r#"{"behaviorData": null}"#).unwrap();
        assert!(ctx.behavior.is_none());
    }

    #[test]
    fn test_readable_telemetry_is_kept() {
        let snapshot: BehaviorSnapshot = serde_json::from_str(
            r#"{"mouseMovements": 12, "keyboardEvents": 3.0, "requestRate": 4, "scrollPattern": null}"#,
        )
        .unwrap();
        assert!(!snapshot.is_malformed());
        assert_eq!(snapshot.pointer_movements, Some(12));
        assert_eq!(snapshot.keystrokes, Some(3));
        assert_eq!(snapshot.request_rate, Some(4.0));
        assert_eq!(snapshot.scroll_pattern, None);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("malformed").is_none());
        let flagged = serde_json::to_value(BehaviorSnapshot::malformed()).unwrap();
        let back: BehaviorSnapshot = serde_json::from_value(flagged).unwrap();
        assert!(back.is_malformed());
    }

    #[test]
    fn test_signal_result_cap() {
        let mut result = SignalResult::clean();
        result.add(15, "a");
        result.add(15, "b");
        let result = result.capped(20);
        assert_eq!(result.penalty, 20);
        assert_eq!(result.reasons, vec!["a", "b"]);
    }

    #[test]
    fn test_reason_fragment() {
        assert_eq!(reason_fragment("X-Forwarded-For"), "x_forwarded_for");
        assert_eq!(reason_fragment("go-http"), "go_http");
    }
}
