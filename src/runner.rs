//! Run coordination.
//!
//! Iterates the orchestrator over the configured servers strictly
//! sequentially - the authenticated session and its challenge trust state
//! are shared, so targets must not contend. Each target gets a fresh tab and
//! a mandatory jittered delay separates consecutive targets to stay under
//! the panel's rate heuristics.

use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use crate::classify::ResultCode;
use crate::orchestrator::Orchestrator;
use crate::probes::SurfaceProvider;
use crate::Target;

/// One processed target and its final code.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReportEntry {
    pub target: Target,
    pub code: ResultCode,
}

/// Append-only per-run report: exactly one entry per processed target.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct RunReport {
    entries: Vec<ReportEntry>,
}

/// Aggregated counts for the human-readable summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub total: usize,
    pub success: usize,
    pub already_done: usize,
    pub failed: usize,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a target's final code. A code already set for a target in the
    /// same pass is never overwritten. Keyed on the full URL: distinct
    /// servers may share a trailing path segment.
    pub fn record(&mut self, target: &Target, code: ResultCode) {
        if self.entries.iter().any(|e| e.target.url == target.url) {
            warn!(
                "duplicate result for server {} ignored (kept first)",
                target.url
            );
            return;
        }
        self.entries.push(ReportEntry {
            target: target.clone(),
            code,
        });
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn code_for(&self, target_id: &str) -> Option<ResultCode> {
        self.entries
            .iter()
            .find(|e| e.target.id == target_id)
            .map(|e| e.code)
    }

    pub fn summary(&self) -> Summary {
        let mut s = Summary {
            total: self.entries.len(),
            success: 0,
            already_done: 0,
            failed: 0,
        };
        for e in &self.entries {
            match e.code {
                ResultCode::Success => s.success += 1,
                ResultCode::AlreadyDone | ResultCode::ControlDisabled => s.already_done += 1,
                _ => s.failed += 1,
            }
        }
        s
    }

    pub fn any_failure(&self) -> bool {
        self.entries.iter().any(|e| e.code.is_failure())
    }

    /// Render the human-readable report.
    pub fn render_text(&self) -> String {
        let summary = self.summary();
        let mut out = String::new();
        out.push_str(&format!(
            "Weirdhost renewal report - {}\n\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
        for e in &self.entries {
            out.push_str(&format!("  {:<24} {}\n", e.target.id, e.code));
        }
        out.push_str(&format!(
            "\n{} total: {} renewed, {} already done, {} failed\n",
            summary.total, summary.success, summary.already_done, summary.failed
        ));
        out
    }

    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        std::fs::write(path, self.render_text())
    }
}

/// Processes every configured target once and aggregates the results.
pub struct RunCoordinator {
    pub orchestrator: Orchestrator,
    /// Mandatory spacing between consecutive targets.
    pub target_delay: Duration,
    /// Upper bound of the random jitter added to the spacing.
    pub delay_jitter: Duration,
}

impl RunCoordinator {
    /// Run one pass over all targets. Every target ends up with exactly one
    /// code; a broken target never aborts the rest of the run.
    pub async fn run(&self, provider: &dyn SurfaceProvider, targets: &[Target]) -> RunReport {
        let mut report = RunReport::new();
        info!("starting run over {} servers", targets.len());

        for (index, target) in targets.iter().enumerate() {
            if index > 0 {
                self.pace().await;
            }

            let code = match provider.open_surface().await {
                Ok(surface) => {
                    let code = self
                        .orchestrator
                        .process_target(surface.as_ref(), target)
                        .await;
                    // Tabs accumulate for the whole run otherwise.
                    surface.close().await;
                    code
                }
                Err(e) => {
                    error!("server {} could not open a fresh tab: {}", target.id, e);
                    ResultCode::NavigationError
                }
            };

            report.record(target, code);
            info!("server {} -> {}", target.id, code);
        }

        let summary = report.summary();
        info!(
            "run finished: {} renewed, {} already done, {} failed",
            summary.success, summary.already_done, summary.failed
        );
        report
    }

    async fn pace(&self) {
        let jitter_ms = self.delay_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..jitter_ms)
        } else {
            0
        };
        let wait = self.target_delay + Duration::from_millis(jitter);
        info!("waiting {:?} before next server", wait);
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserError;
    use crate::challenge::ChallengeResolver;
    use crate::probes::testing::FakeSurface;
    use crate::probes::{ControlProbe, TargetSurface};
    use async_trait::async_trait;
    use std::io::Read;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    struct FakeProvider {
        surfaces: Mutex<Vec<FakeSurface>>,
    }

    impl FakeProvider {
        fn new(surfaces: Vec<FakeSurface>) -> Self {
            Self {
                surfaces: Mutex::new(surfaces),
            }
        }
    }

    #[async_trait]
    impl SurfaceProvider for FakeProvider {
        async fn open_surface(&self) -> Result<Box<dyn TargetSurface>, BrowserError> {
            let mut surfaces = self.surfaces.lock().unwrap();
            if surfaces.is_empty() {
                return Err(BrowserError::ConnectionLost("no surface scripted".into()));
            }
            Ok(Box::new(surfaces.remove(0)))
        }
    }

    fn coordinator(delay: Duration) -> RunCoordinator {
        RunCoordinator {
            orchestrator: Orchestrator {
                button_text: "시간 추가".to_string(),
                success_keywords: vec!["success".to_string()],
                resolver: ChallengeResolver {
                    timeout: Duration::from_millis(100),
                    poll_interval: Duration::from_millis(10),
                    nudge_every: 2,
                    nudge_attempts: 1,
                    strict_proof: false,
                },
                post_click_settle: Duration::ZERO,
                artifact_dir: std::env::temp_dir().join("weirdhost-renew-test-artifacts"),
            },
            target_delay: delay,
            delay_jitter: Duration::ZERO,
        }
    }

    fn targets(n: usize) -> Vec<Target> {
        (1..=n)
            .map(|i| Target::from_url(&format!("https://hub.weirdhost.xyz/server/srv{}", i)))
            .collect()
    }

    #[tokio::test]
    async fn one_code_per_target_and_no_cross_contamination() {
        let mut ok1 = FakeSurface::new();
        ok1.success_text = true;
        let mut broken = FakeSurface::new();
        broken.control_probes = vec![];
        let mut ok3 = FakeSurface::new();
        ok3.already_text = true;

        let provider = FakeProvider::new(vec![ok1, broken, ok3]);
        let report = coordinator(Duration::ZERO)
            .run(&provider, &targets(3))
            .await;

        assert_eq!(report.entries().len(), 3);
        assert_eq!(report.code_for("srv1"), Some(ResultCode::Success));
        assert_eq!(report.code_for("srv2"), Some(ResultCode::NoControl));
        assert_eq!(report.code_for("srv3"), Some(ResultCode::AlreadyDone));
    }

    #[tokio::test]
    async fn provider_failure_is_a_navigation_error_not_an_abort() {
        let mut ok = FakeSurface::new();
        ok.success_text = true;

        // Only one surface scripted - the second open fails.
        let provider = FakeProvider::new(vec![ok]);
        let report = coordinator(Duration::ZERO)
            .run(&provider, &targets(2))
            .await;

        assert_eq!(report.code_for("srv1"), Some(ResultCode::Success));
        assert_eq!(report.code_for("srv2"), Some(ResultCode::NavigationError));
        assert!(report.any_failure());
    }

    #[tokio::test]
    async fn inter_target_spacing_is_applied() {
        let mut a = FakeSurface::new();
        a.success_text = true;
        let mut b = FakeSurface::new();
        b.success_text = true;

        let provider = FakeProvider::new(vec![a, b]);
        let started = std::time::Instant::now();
        coordinator(Duration::from_millis(80))
            .run(&provider, &targets(2))
            .await;

        // One gap between two targets; shortened for tests, never removed.
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn each_surface_is_closed_after_its_target() {
        let mut a = FakeSurface::new();
        a.success_text = true;
        let a_closes = a.closes.clone();
        let mut b = FakeSurface::new();
        b.control_probes = vec![];
        let b_closes = b.closes.clone();

        let provider = FakeProvider::new(vec![a, b]);
        coordinator(Duration::ZERO)
            .run(&provider, &targets(2))
            .await;

        assert_eq!(a_closes.load(Ordering::Relaxed), 1);
        assert_eq!(b_closes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn targets_sharing_a_trailing_segment_are_reported_separately() {
        let mut report = RunReport::new();
        report.record(
            &Target::from_url("https://hub.weirdhost.xyz/server/a/renew"),
            ResultCode::Success,
        );
        report.record(
            &Target::from_url("https://hub.weirdhost.xyz/server/b/renew"),
            ResultCode::Blocked,
        );

        assert_eq!(report.entries().len(), 2);
        assert!(report.any_failure());
    }

    #[tokio::test]
    async fn report_never_overwrites_a_recorded_code() {
        let mut report = RunReport::new();
        let target = Target::from_url("https://hub.weirdhost.xyz/server/srv1");
        report.record(&target, ResultCode::Success);
        report.record(&target, ResultCode::Blocked);

        assert_eq!(report.entries().len(), 1);
        assert_eq!(report.code_for("srv1"), Some(ResultCode::Success));
    }

    #[tokio::test]
    async fn summary_counts_and_text_report() {
        let mut report = RunReport::new();
        report.record(
            &Target::from_url("https://h/x/srv1"),
            ResultCode::Success,
        );
        report.record(
            &Target::from_url("https://h/x/srv2"),
            ResultCode::AlreadyDone,
        );
        report.record(
            &Target::from_url("https://h/x/srv3"),
            ResultCode::ChallengeFailed,
        );

        let summary = report.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.success, 1);
        assert_eq!(summary.already_done, 1);
        assert_eq!(summary.failed, 1);
        assert!(report.any_failure());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        report.write_to_file(path.to_str().unwrap()).unwrap();

        let mut text = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert!(text.contains("srv1"));
        assert!(text.contains("challenge_failed"));
        assert!(text.contains("1 renewed, 1 already done, 1 failed"));
    }
}
