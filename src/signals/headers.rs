//! Header signals.
//!
//! - Proxy hop headers
//! - Missing common browser headers
//! - Generic `Accept: */*`

use super::{reason_fragment, RequestContext, SignalResult, SignalRule};
use crate::config::HeaderConfig;

const CAP: u8 = 20;

/// Header rule.
pub struct HeaderRule {
    proxy_headers: Vec<String>,
    proxy_header_penalty: u8,
    browser_headers: Vec<String>,
    missing_browser_headers_penalty: u8,
    generic_accept_penalty: u8,
}

impl HeaderRule {
    /// Create a rule from configuration.
    pub fn new(config: &HeaderConfig) -> Self {
        Self {
            proxy_headers: config.proxy_headers.iter().map(|h| h.to_lowercase()).collect(),
            proxy_header_penalty: config.proxy_header_penalty,
            browser_headers: config.browser_headers.iter().map(|h| h.to_lowercase()).collect(),
            missing_browser_headers_penalty: config.missing_browser_headers_penalty,
            generic_accept_penalty: config.generic_accept_penalty,
        }
    }
}

impl Default for HeaderRule {
    fn default() -> Self {
        Self::new(&HeaderConfig::default())
    }
}

impl SignalRule for HeaderRule {
    fn evaluate(&self, ctx: &RequestContext) -> SignalResult {
        let mut result = SignalResult::clean();

        for header in &self.proxy_headers {
            if ctx.has_header(header) {
                result.add(
                    self.proxy_header_penalty,
                    format!("proxy_header_{}", reason_fragment(header)),
                );
            }
        }

        let missing: Vec<&str> = self
            .browser_headers
            .iter()
            .filter(|h| !ctx.has_header(h))
            .map(|h| h.as_str())
            .collect();
        if missing.len() > 1 {
            result.add(
                self.missing_browser_headers_penalty,
                format!(
                    "missing_browser_headers_{}",
                    missing.iter().map(|h| reason_fragment(h)).collect::<Vec<_>>().join("_")
                ),
            );
        }

        if ctx.header("accept").map(str::trim) == Some("*/*") {
            result.add(self.generic_accept_penalty, "generic_accept_header");
        }

        result.capped(CAP)
    }

    fn cap(&self) -> u8 {
        CAP
    }

    fn name(&self) -> &'static str {
        "headers"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn browser_ctx() -> RequestContext {
        RequestContext::new(Some("Mozilla/5.0"), Some("127.0.0.1"))
            .with_header("Accept", "text/html,application/xhtml+xml")
            .with_header("Accept-Language", "en-US,en;q=0.9")
            .with_header("Accept-Encoding", "gzip, deflate, br")
    }

    #[test]
    fn test_browser_headers() {
        let result = HeaderRule::default().evaluate(&browser_ctx());
        assert_eq!(result.penalty, 0);
    }

    #[test]
    fn test_single_missing_header_is_tolerated() {
        let ctx = RequestContext::default()
            .with_header("accept", "text/html")
            .with_header("accept-encoding", "gzip");
        assert_eq!(HeaderRule::default().evaluate(&ctx).penalty, 0);
    }

    #[test]
    fn test_missing_headers() {
        let ctx = RequestContext::default().with_header("accept", "text/html");
        let result = HeaderRule::default().evaluate(&ctx);
        assert_eq!(result.penalty, 10);
        assert_eq!(
            result.reasons,
            vec!["missing_browser_headers_accept_language_accept_encoding"]
        );
    }

    #[test]
    fn test_blank_headers_count_as_missing() {
        let ctx = RequestContext::default()
            .with_header("accept", "")
            .with_header("accept-language", " ")
            .with_header("accept-encoding", "gzip");
        let result = HeaderRule::default().evaluate(&ctx);
        assert_eq!(result.penalty, 10);
        assert_eq!(
            result.reasons,
            vec!["missing_browser_headers_accept_accept_language"]
        );
    }

    #[test]
    fn test_proxy_headers() {
        let ctx = browser_ctx()
            .with_header("X-Forwarded-For", "10.0.0.1")
            .with_header("Via", "1.1 proxy");
        let result = HeaderRule::default().evaluate(&ctx);
        assert_eq!(result.penalty, 10);
        assert_eq!(
            result.reasons,
            vec!["proxy_header_x_forwarded_for", "proxy_header_via"]
        );
    }

    #[test]
    fn test_generic_accept() {
        let ctx = RequestContext::default()
            .with_header("accept", "*/*")
            .with_header("accept-language", "en")
            .with_header("accept-encoding", "gzip");
        let result = HeaderRule::default().evaluate(&ctx);
        assert_eq!(result.penalty, 5);
        assert_eq!(result.reasons, vec!["generic_accept_header"]);
    }

    #[test]
    fn test_group_cap() {
        let ctx = RequestContext::default()
            .with_header("accept", "*/*")
            .with_header("x-forwarded-for", "1.1.1.1")
            .with_header("x-real-ip", "1.1.1.1")
            .with_header("via", "proxy")
            .with_header("x-proxy", "yes");
        let result = HeaderRule::default().evaluate(&ctx);
        assert_eq!(result.penalty, 20);
        assert_eq!(result.reasons.len(), 6);
    }
}
