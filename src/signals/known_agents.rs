//! Known good agents.
//!
//! Search engine crawlers and uptime monitors that are always allowed,
//! whatever the heuristic signals say.

use regex::Regex;

/// Compiled allow-list of crawler and monitor signatures.
pub struct KnownAgentList {
    agents: Vec<(String, Regex)>,
}

impl KnownAgentList {
    /// Compile the signatures. Each one matches as a case-insensitive substring.
    pub fn new<S: AsRef<str>>(signatures: &[S]) -> Self {
        let agents = signatures
            .iter()
            .map(|s| s.as_ref().trim())
            .filter(|s| !s.is_empty())
            .filter_map(|s| {
                Regex::new(&format!("(?i){}", regex::escape(s)))
                    .ok()
                    .map(|re| (s.to_string(), re))
            })
            .collect();
        Self { agents }
    }

    /// Name of the first signature the agent matches.
    pub fn matched(&self, user_agent: Option<&str>) -> Option<&str> {
        let ua = user_agent?;
        self.agents
            .iter()
            .find(|(_, re)| re.is_match(ua))
            .map(|(name, _)| name.as_str())
    }

    pub fn is_known_good(&self, user_agent: Option<&str>) -> bool {
        self.matched(user_agent).is_some()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for KnownAgentList {
    fn default() -> Self {
        Self::new(&crate::config::ClassifierConfig::default().known_good_agents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_googlebot() {
        let list = KnownAgentList::default();
        let ua = "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";
        assert_eq!(list.matched(Some(ua)), Some("googlebot"));
    }

    #[test]
    fn test_monitor() {
        let list = KnownAgentList::default();
        assert!(list.is_known_good(Some("Mozilla/5.0+(compatible; UptimeRobot/2.0)")));
    }

    #[test]
    fn test_browser_is_not_known() {
        let list = KnownAgentList::default();
        assert!(!list.is_known_good(Some("Mozilla/5.0 Chrome/120.0 Safari/537.36")));
        assert!(!list.is_known_good(None));
    }

    #[test]
    fn test_signatures_are_escaped() {
        let list = KnownAgentList::new(&["probe.v1"]);
        assert!(list.is_known_good(Some("Probe.V1 monitor")));
        assert!(!list.is_known_good(Some("probeXv1")));
    }

    #[test]
    fn test_blank_signatures_ignored() {
        let list = KnownAgentList::new(&["", "  ", "slackbot"]);
        assert_eq!(list.len(), 1);
    }
}
