//! Signal probes and the surface they run against.
//!
//! A probe is a read-only check of current page state used as evidence for
//! outcome classification. Probes never fail: a broken or missing page is
//! reported as "signal absent", so the state machine can poll them freely.
//! The [`TargetSurface`] trait is the seam between the renewal state machine
//! and the real browser; tests drive the machine with a scripted fake.

use std::path::Path;

use async_trait::async_trait;

use crate::browser::BrowserError;

/// A response from the renew backend route, intercepted since the click.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BackendResponse {
    pub status: u16,
    pub body: String,
    pub url: String,
}

impl BackendResponse {
    /// Explicit rejection by the backend: auth/rate-limit class statuses.
    pub fn is_rejection(&self) -> bool {
        matches!(self.status, 401 | 403 | 429)
    }

    pub fn is_success_status(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// A 2xx body counts as positive when it carries a success keyword or is
    /// empty (the panel answers 204 with no body on a successful renewal).
    pub fn has_positive_body(&self, success_keywords: &[String]) -> bool {
        if self.body.trim().is_empty() {
            return true;
        }
        let body = self.body.to_lowercase();
        success_keywords
            .iter()
            .any(|k| body.contains(&k.to_lowercase()))
    }
}

/// One way of finding the renew button. Tried in order; first strategy that
/// yields a visible, interactable control wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlStrategy {
    /// Button whose trimmed text equals the label exactly.
    ExactText(String),
    /// Button whose text contains the label.
    SubstringText(String),
    /// CSS attribute selector, e.g. `button[data-action="renew"]`.
    Attribute(String),
}

impl ControlStrategy {
    /// The ordered strategy list for a given button label.
    pub fn ordered(button_text: &str) -> Vec<ControlStrategy> {
        vec![
            ControlStrategy::ExactText(button_text.to_string()),
            ControlStrategy::SubstringText(button_text.to_string()),
            ControlStrategy::Attribute("button[data-action=\"renew\"]".to_string()),
            ControlStrategy::Attribute("button[aria-label*=\"renew\" i]".to_string()),
        ]
    }

    pub fn describe(&self) -> String {
        match self {
            ControlStrategy::ExactText(t) => format!("exact text '{}'", t),
            ControlStrategy::SubstringText(t) => format!("substring text '{}'", t),
            ControlStrategy::Attribute(sel) => format!("attribute {}", sel),
        }
    }
}

/// Result of probing one control-selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlProbe {
    /// No matching element.
    Missing,
    /// Matched, but the control cannot be invoked.
    Disabled,
    /// Matched, visible and interactable.
    Ready,
}

/// Read-only checks against the current page/session state.
///
/// Contract: safe to call at any time, never raise on "not found" (falsy
/// instead), and each call completes within a short bounded time so callers
/// can poll in a loop.
#[async_trait]
pub trait SignalProbes: Send + Sync {
    /// A challenge-hosting iframe is attached and visible.
    async fn challenge_widget_present(&self) -> bool;

    /// No challenge iframe remains, or a completion marker (response token,
    /// clearance cookie) is present. Both proofs are accepted.
    async fn challenge_widget_cleared(&self) -> bool;

    /// A completion marker alone, regardless of widget attachment. Used for
    /// the strict-proof mode and the marker-beats-widget tie-break.
    async fn challenge_marker_present(&self) -> bool;

    async fn success_text_present(&self) -> bool;

    async fn already_done_text_present(&self) -> bool;

    /// The renew control can no longer be invoked (disabled or gone).
    async fn control_disabled_or_absent(&self) -> bool;

    /// Most recent intercepted response from the renew backend route since
    /// the click, if any has arrived.
    async fn backend_response(&self) -> Option<BackendResponse>;

    /// Cheap hash of the rendered text, for the no-change fallback.
    async fn page_fingerprint(&self) -> u64;
}

/// The per-target browser surface the orchestrator drives. One instance per
/// target pass; invalid after the pass ends.
#[async_trait]
pub trait TargetSurface: SignalProbes {
    async fn goto(&self, url: &str) -> Result<(), BrowserError>;

    /// Probe one selection strategy. A `Ready` result must leave the control
    /// addressable for a subsequent [`click_control`](Self::click_control).
    async fn query_control(&self, strategy: &ControlStrategy) -> ControlProbe;

    /// Primary invocation: real element click.
    async fn click_control(&self) -> Result<(), BrowserError>;

    /// Fallback invocation: script-level event dispatch.
    async fn dispatch_click_js(&self) -> Result<(), BrowserError>;

    /// Best-effort attempt to move the challenge along (a click on the
    /// widget). May be a no-op when an out-of-band solver extension handles
    /// the challenge. Callers ignore failures.
    async fn nudge_challenge(&self) -> anyhow::Result<()>;

    async fn screenshot(&self, path: &Path) -> Result<(), BrowserError>;

    /// Release the tab backing this surface. Best-effort; the coordinator
    /// calls it exactly once after the target's code is recorded.
    async fn close(&self);
}

/// Opens a fresh, isolated surface (tab) for each target.
#[async_trait]
pub trait SurfaceProvider: Send + Sync {
    async fn open_surface(&self) -> Result<Box<dyn TargetSurface>, BrowserError>;
}

pub fn text_contains_any(text: &str, keywords: &[String]) -> bool {
    let text = text.to_lowercase();
    keywords
        .iter()
        .any(|k| !k.is_empty() && text.contains(&k.to_lowercase()))
}

pub fn fingerprint_text(text: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_statuses() {
        let mut resp = BackendResponse {
            status: 429,
            body: String::new(),
            url: "/renew".into(),
        };
        assert!(resp.is_rejection());
        resp.status = 204;
        assert!(!resp.is_rejection());
        assert!(resp.is_success_status());
    }

    #[test]
    fn empty_two_xx_body_is_positive() {
        let resp = BackendResponse {
            status: 204,
            body: "  ".into(),
            url: "/renew".into(),
        };
        assert!(resp.has_positive_body(&["success".into()]));
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        assert!(text_contains_any(
            "Renewal SUCCESS!",
            &["success".to_string()]
        ));
        assert!(!text_contains_any("nothing here", &["success".to_string()]));
    }

    #[test]
    fn strategy_order_prefers_exact_text() {
        let order = ControlStrategy::ordered("시간 추가");
        assert!(matches!(order[0], ControlStrategy::ExactText(_)));
        assert!(matches!(order[1], ControlStrategy::SubstringText(_)));
        assert!(matches!(order[2], ControlStrategy::Attribute(_)));
    }
}
