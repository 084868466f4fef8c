//! Per-target state machine.
//!
//! NAV -> LOCATE_CONTROL -> INVOKE -> AWAIT_CHALLENGE -> CLASSIFY, strictly
//! one-directional within a single pass. Every failure is downgraded to a
//! [`ResultCode`]; nothing escapes past this module for a single target.
//! At most one renew click is attempted per target per pass - retries target
//! the challenge, never the click.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::challenge::{ChallengeResolver, ChallengeState, SurfaceNudge};
use crate::classify::{classify, ResultCode, Signals};
use crate::probes::{ControlProbe, ControlStrategy, TargetSurface};
use crate::Target;

/// Drives one target from navigation to a final result code.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    /// Visible label of the renew button.
    pub button_text: String,
    /// Success keywords, shared with the classifier's body-marker check.
    pub success_keywords: Vec<String>,
    pub resolver: ChallengeResolver,
    /// Settle time between challenge pass and signal gathering - the panel
    /// updates its flash message shortly after the backend answers.
    pub post_click_settle: Duration,
    /// Where diagnostic screenshots land.
    pub artifact_dir: PathBuf,
}

impl Orchestrator {
    pub async fn process_target(&self, surface: &dyn TargetSurface, target: &Target) -> ResultCode {
        info!("processing server {}", target.id);

        // NAV
        if let Err(e) = surface.goto(&target.url).await {
            warn!("server {} navigation failed: {}", target.id, e);
            self.capture(surface, target, "nav").await;
            return ResultCode::NavigationError;
        }

        let pre_click = surface.page_fingerprint().await;

        // LOCATE_CONTROL
        let mut found_disabled = false;
        let mut located = false;
        for strategy in ControlStrategy::ordered(&self.button_text) {
            match surface.query_control(&strategy).await {
                ControlProbe::Ready => {
                    info!(
                        "server {} renew button located by {}",
                        target.id,
                        strategy.describe()
                    );
                    located = true;
                    break;
                }
                ControlProbe::Disabled => {
                    found_disabled = true;
                }
                ControlProbe::Missing => {}
            }
        }

        if !located {
            if found_disabled {
                info!(
                    "server {} renew button disabled, treating as already satisfied",
                    target.id
                );
                return ResultCode::ControlDisabled;
            }
            warn!("server {} renew button not found by any strategy", target.id);
            self.capture(surface, target, "locate").await;
            return ResultCode::NoControl;
        }

        // INVOKE: element click first, script dispatch as fallback
        if let Err(primary) = surface.click_control().await {
            warn!(
                "server {} element click failed ({}), falling back to JS dispatch",
                target.id, primary
            );
            if let Err(fallback) = surface.dispatch_click_js().await {
                warn!("server {} JS dispatch failed too: {}", target.id, fallback);
                self.capture(surface, target, "invoke").await;
                return ResultCode::InvokeError;
            }
        }

        // AWAIT_CHALLENGE
        let nudge = SurfaceNudge::new(surface);
        let state = self.resolver.resolve(surface, &nudge).await;
        if state == ChallengeState::TimedOut {
            self.capture(surface, target, "challenge").await;
            return ResultCode::ChallengeFailed;
        }

        if !self.post_click_settle.is_zero() {
            tokio::time::sleep(self.post_click_settle).await;
        }

        // CLASSIFY
        let signals = Signals {
            backend: surface.backend_response().await,
            already_done_text: surface.already_done_text_present().await,
            success_text: surface.success_text_present().await,
            control_disabled_or_absent: surface.control_disabled_or_absent().await,
            content_changed: surface.page_fingerprint().await != pre_click,
        };

        let code = classify(&signals, &self.success_keywords);
        info!("server {} classified as {}", target.id, code);

        if code.is_failure() {
            self.capture(surface, target, "classify").await;
        }
        code
    }

    /// Best-effort diagnostic screenshot for offline triage.
    async fn capture(&self, surface: &dyn TargetSurface, target: &Target, stage: &str) {
        let _ = std::fs::create_dir_all(&self.artifact_dir);
        let name = format!(
            "{}-{}-{}.png",
            target.id,
            stage,
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        );
        let path = self.artifact_dir.join(name);
        match surface.screenshot(&path).await {
            Ok(()) => info!("saved diagnostic screenshot to {}", path.display()),
            Err(e) => warn!("screenshot failed (ignored): {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengeResolver;
    use crate::probes::testing::FakeSurface;
    use crate::probes::BackendResponse;
    use std::sync::atomic::Ordering;

    fn orchestrator() -> Orchestrator {
        Orchestrator {
            button_text: "시간 추가".to_string(),
            success_keywords: vec!["success".to_string(), "added".to_string()],
            resolver: ChallengeResolver {
                timeout: Duration::from_millis(200),
                poll_interval: Duration::from_millis(10),
                nudge_every: 2,
                nudge_attempts: 1,
                strict_proof: false,
            },
            post_click_settle: Duration::ZERO,
            artifact_dir: std::env::temp_dir().join("weirdhost-renew-test-artifacts"),
        }
    }

    fn target() -> Target {
        Target::from_url("https://hub.weirdhost.xyz/server/abc123")
    }

    #[tokio::test]
    async fn navigation_failure_is_classified_and_captured() {
        let mut surface = FakeSurface::new();
        surface.goto_fails = true;

        let code = orchestrator().process_target(&surface, &target()).await;

        assert_eq!(code, ResultCode::NavigationError);
        assert_eq!(surface.screenshots.lock().unwrap().len(), 1);
        assert!(!surface.clicked());
    }

    #[tokio::test]
    async fn missing_control_yields_no_control() {
        let mut surface = FakeSurface::new();
        surface.control_probes = vec![];

        let code = orchestrator().process_target(&surface, &target()).await;

        assert_eq!(code, ResultCode::NoControl);
        assert!(!surface.clicked());
    }

    #[tokio::test]
    async fn disabled_control_short_circuits_before_challenge() {
        let mut surface = FakeSurface::new();
        surface.control_probes = vec![ControlProbe::Disabled];
        surface.widget_present = true;

        let code = orchestrator().process_target(&surface, &target()).await;

        assert_eq!(code, ResultCode::ControlDisabled);
        assert!(!surface.clicked());
        // Never reached AWAIT_CHALLENGE: no nudge side effects.
        assert_eq!(surface.nudges.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn later_strategy_wins_over_earlier_disabled_match() {
        let mut surface = FakeSurface::new();
        surface.control_probes = vec![
            ControlProbe::Missing,
            ControlProbe::Disabled,
            ControlProbe::Ready,
        ];
        surface.success_text = true;

        let code = orchestrator().process_target(&surface, &target()).await;

        assert_eq!(code, ResultCode::Success);
        assert_eq!(surface.clicks.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn scenario_a_success_text_after_clean_click() {
        let mut surface = FakeSurface::new();
        surface.success_text = true;

        let code = orchestrator().process_target(&surface, &target()).await;

        assert_eq!(code, ResultCode::Success);
        assert_eq!(surface.clicks.load(Ordering::Relaxed), 1);
        assert_eq!(surface.nudges.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn scenario_b_late_clear_then_already_done() {
        let mut surface = FakeSurface::new();
        surface.widget_present = true;
        surface.clears_after_polls = Some(3);
        surface.already_text = true;

        let code = orchestrator().process_target(&surface, &target()).await;

        assert_eq!(code, ResultCode::AlreadyDone);
    }

    #[tokio::test]
    async fn scenario_c_unresolved_challenge_fails_with_screenshot() {
        let mut surface = FakeSurface::new();
        surface.widget_present = true;
        surface.clears_after_polls = None;

        let code = orchestrator().process_target(&surface, &target()).await;

        assert_eq!(code, ResultCode::ChallengeFailed);
        assert_eq!(surface.screenshots.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fallback_dispatch_covers_failed_element_click() {
        let mut surface = FakeSurface::new();
        surface.click_fails = true;
        surface.success_text = true;

        let code = orchestrator().process_target(&surface, &target()).await;

        assert_eq!(code, ResultCode::Success);
        assert_eq!(surface.clicks.load(Ordering::Relaxed), 0);
        assert_eq!(surface.dispatches.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn both_invocations_failing_is_invoke_error() {
        let mut surface = FakeSurface::new();
        surface.click_fails = true;
        surface.dispatch_fails = true;

        let code = orchestrator().process_target(&surface, &target()).await;

        assert_eq!(code, ResultCode::InvokeError);
        assert_eq!(surface.screenshots.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backend_rejection_beats_success_text_end_to_end() {
        let surface = FakeSurface::new();
        *surface.backend.lock().unwrap() = Some(BackendResponse {
            status: 403,
            body: "forbidden".into(),
            url: "/api/client/servers/abc123/renew".into(),
        });
        let mut surface = surface;
        surface.success_text = true;

        let code = orchestrator().process_target(&surface, &target()).await;

        assert_eq!(code, ResultCode::Blocked);
    }

    #[tokio::test]
    async fn unchanged_page_is_no_change() {
        let mut surface = FakeSurface::new();
        surface.fingerprint_after = surface.fingerprint_before;

        let code = orchestrator().process_target(&surface, &target()).await;

        assert_eq!(code, ResultCode::NoChange);
    }
}
