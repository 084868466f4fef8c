//! Outcome classification.
//!
//! Maps the raw signals gathered after a renew click into the closed result
//! taxonomy, applying a fixed precedence: network-level truth outranks
//! DOM-text heuristics, which outrank control-state heuristics, which
//! outrank the bare nothing-changed fallback.

use crate::probes::BackendResponse;

/// The closed-set outcome attached to a target after one processing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    /// Renewal confirmed (backend response, page text, or control vanishing).
    Success,
    /// Renewal was already done for this period.
    AlreadyDone,
    /// Backend explicitly rejected the request (auth / rate limit).
    Blocked,
    /// Content changed after the click but no signal matched.
    Unknown,
    /// Page content identical to the pre-click snapshot.
    NoChange,
    /// Page failed to load.
    NavigationError,
    /// Renew button never found by any strategy.
    NoControl,
    /// Renew button found but inert before any click.
    ControlDisabled,
    /// Every invocation method failed.
    InvokeError,
    /// Challenge never cleared within the timeout.
    ChallengeFailed,
    /// Session was never authenticated.
    LoginFailed,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::AlreadyDone => "already_done",
            ResultCode::Blocked => "blocked",
            ResultCode::Unknown => "unknown",
            ResultCode::NoChange => "no_change",
            ResultCode::NavigationError => "navigation_error",
            ResultCode::NoControl => "no_control",
            ResultCode::ControlDisabled => "control_disabled",
            ResultCode::InvokeError => "invoke_error",
            ResultCode::ChallengeFailed => "challenge_failed",
            ResultCode::LoginFailed => "login_failed",
        }
    }

    /// Codes that make the whole run exit non-zero. A disabled control is
    /// treated as already satisfied and stays clean.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            ResultCode::Success | ResultCode::AlreadyDone | ResultCode::ControlDisabled
        )
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of every signal gathered after the challenge reached PASSED.
#[derive(Debug, Clone, Default)]
pub struct Signals {
    pub backend: Option<BackendResponse>,
    pub already_done_text: bool,
    pub success_text: bool,
    pub control_disabled_or_absent: bool,
    pub content_changed: bool,
}

/// Apply the fixed precedence order. First match wins.
pub fn classify(signals: &Signals, success_keywords: &[String]) -> ResultCode {
    if let Some(ref resp) = signals.backend {
        if resp.is_rejection() {
            return ResultCode::Blocked;
        }
        if resp.is_success_status() && resp.has_positive_body(success_keywords) {
            return ResultCode::Success;
        }
    }

    if signals.already_done_text {
        return ResultCode::AlreadyDone;
    }

    if signals.success_text {
        return ResultCode::Success;
    }

    // Disappearance of the control is accepted as indirect proof.
    if signals.control_disabled_or_absent {
        return ResultCode::Success;
    }

    if signals.content_changed {
        ResultCode::Unknown
    } else {
        ResultCode::NoChange
    }
}
