//! Challenge resolution.
//!
//! Drives the Turnstile interstitial toward completion: once the widget has
//! been seen, poll the signal probes until a completion proof appears or the
//! budget runs out, occasionally nudging the widget. The actual solving is
//! external (a solver extension, or the nudge click itself) - this module
//! only waits and decides.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::probes::{SignalProbes, TargetSurface};

/// Challenge lifecycle. Only ever advances forward within one target pass:
/// Absent -> Present -> Resolving -> Passed | TimedOut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeState {
    Absent,
    Present,
    Resolving,
    Passed,
    TimedOut,
}

impl ChallengeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChallengeState::Passed | ChallengeState::TimedOut)
    }
}

/// Injected best-effort solve capability. Failures are always ignored.
#[async_trait]
pub trait ChallengeNudge: Send + Sync {
    async fn nudge(&self) -> anyhow::Result<()>;
}

/// Nudge for the out-of-band solver-extension mode: does nothing.
pub struct NoopNudge;

#[async_trait]
impl ChallengeNudge for NoopNudge {
    async fn nudge(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Nudge that clicks the widget through the target surface.
pub struct SurfaceNudge<'a> {
    surface: &'a dyn TargetSurface,
}

impl<'a> SurfaceNudge<'a> {
    pub fn new(surface: &'a dyn TargetSurface) -> Self {
        Self { surface }
    }
}

#[async_trait]
impl ChallengeNudge for SurfaceNudge<'_> {
    async fn nudge(&self) -> anyhow::Result<()> {
        self.surface.nudge_challenge().await
    }
}

/// Retry an operation up to `max_attempts` times with linear backoff.
pub async fn retry_with_backoff<F, Fut, T, E>(
    max_attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(_) => tokio::time::sleep(base_delay * attempt).await,
        }
    }
}

/// Brings a present challenge to a terminal state within a time budget.
#[derive(Debug, Clone)]
pub struct ChallengeResolver {
    /// Overall wait budget.
    pub timeout: Duration,
    /// Spacing between probe polls.
    pub poll_interval: Duration,
    /// Nudge at most once per this many poll iterations.
    pub nudge_every: u32,
    /// Nudge retry attempts per invocation.
    pub nudge_attempts: u32,
    /// Completion marker required; widget disappearance alone is not proof.
    pub strict_proof: bool,
}

impl Default for ChallengeResolver {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(1500),
            nudge_every: 4,
            nudge_attempts: 3,
            strict_proof: false,
        }
    }
}

impl ChallengeResolver {
    pub fn new(timeout: Duration, strict_proof: bool) -> Self {
        Self {
            timeout,
            strict_proof,
            ..Default::default()
        }
    }

    /// Resolve the challenge, returning `Passed` or `TimedOut`.
    ///
    /// If no widget is present at entry the flow passes immediately and the
    /// nudge is never invoked. Completion markers outrank widget attachment:
    /// a widget still in the DOM whose response token has already been
    /// written counts as cleared.
    pub async fn resolve(
        &self,
        probes: &dyn SignalProbes,
        nudge: &dyn ChallengeNudge,
    ) -> ChallengeState {
        if !probes.challenge_widget_present().await {
            debug!("no challenge widget raised, passing through");
            return ChallengeState::Passed;
        }

        info!("challenge widget present, waiting up to {:?}", self.timeout);
        let started = Instant::now();
        let mut state = ChallengeState::Present;
        let mut iteration: u32 = 0;

        loop {
            if probes.challenge_marker_present().await {
                info!(
                    "challenge completion marker present after {:?}",
                    started.elapsed()
                );
                return ChallengeState::Passed;
            }

            if !self.strict_proof && probes.challenge_widget_cleared().await {
                info!("challenge widget cleared after {:?}", started.elapsed());
                return ChallengeState::Passed;
            }

            if started.elapsed() >= self.timeout {
                warn!("challenge not cleared within {:?}", self.timeout);
                return ChallengeState::TimedOut;
            }

            if iteration > 0 && self.nudge_every > 0 && iteration % self.nudge_every == 0 {
                if state == ChallengeState::Present {
                    state = ChallengeState::Resolving;
                }
                debug!("nudging challenge widget (iteration {})", iteration);
                let result = retry_with_backoff(self.nudge_attempts, Duration::from_millis(250), || {
                    nudge.nudge()
                })
                .await;
                if let Err(e) = result {
                    debug!("nudge failed (ignored): {}", e);
                }
            }

            iteration += 1;
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
