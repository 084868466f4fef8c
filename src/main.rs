//! Weirdhost renewal bot entrypoint.
//!
//! One pass: authenticate, process every configured server page once, print
//! the report and exit non-zero if anything failed.

use std::time::Duration;

use anyhow::Context;
use tracing::{error, info};

use weirdhost_renew::auth::{self, Credentials};
use weirdhost_renew::browser::{BrowserSession, BrowserSessionConfig, PageSettings};
use weirdhost_renew::challenge::ChallengeResolver;
use weirdhost_renew::orchestrator::Orchestrator;
use weirdhost_renew::runner::RunCoordinator;
use weirdhost_renew::{artifact_dir, init_logging, AppConfig};

#[tokio::main]
async fn main() {
    let _log_guard = init_logging();

    match run().await {
        Ok(any_failure) => {
            if any_failure {
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("run aborted: {:#}", e);
            std::process::exit(2);
        }
    }
}

async fn run() -> anyhow::Result<bool> {
    let config = AppConfig::from_env();

    // Systemic preconditions: fail the whole run before touching any target.
    if config.targets.is_empty() {
        anyhow::bail!("no servers configured: set WEIRDHOST_SERVER_URLS");
    }
    if !config.has_auth() {
        anyhow::bail!(
            "no credentials configured: set REMEMBER_WEB_COOKIE or WEIRDHOST_EMAIL/WEIRDHOST_PASSWORD"
        );
    }

    info!(
        "renewing {} server(s) on {}",
        config.targets.len(),
        config.base_url
    );

    let solver_extension = config
        .solver_extension_dir
        .clone()
        .or_else(BrowserSessionConfig::find_solver_extension);

    let session_config = BrowserSessionConfig::default()
        .headless(config.headless)
        .chrome_path(config.chrome_path.clone())
        .solver_extension(solver_extension)
        .nav_timeout(config.nav_timeout_secs);

    let page_settings = PageSettings {
        success_keywords: config.success_keywords.clone(),
        already_keywords: config.already_keywords.clone(),
        button_text: config.button_text.clone(),
        endpoint_pattern: config.endpoint_pattern.clone(),
        nav_timeout: config.nav_timeout(),
        eval_timeout: Duration::from_secs(10),
    };

    let session = BrowserSession::launch(session_config, page_settings)
        .await
        .context("browser launch failed")?;

    let credentials = Credentials {
        remember_cookie: (!config.remember_web_cookie.is_empty())
            .then(|| config.remember_web_cookie.clone()),
        email: (!config.email.is_empty()).then(|| config.email.clone()),
        password: (!config.password.is_empty()).then(|| config.password.clone()),
    };

    // Authentication is a precondition for every target: when it fails, the
    // whole run is reported as login_failed rather than aborted opaquely.
    if let Err(e) = auth::login(&session, &config.base_url, &config.login_url, &credentials).await {
        error!("login failed: {}", e);
        let mut report = weirdhost_renew::runner::RunReport::new();
        for target in &config.targets {
            report.record(target, weirdhost_renew::classify::ResultCode::LoginFailed);
        }
        print!("{}", report.render_text());
        if let Some(ref path) = config.report_file {
            let _ = report.write_to_file(path);
        }
        session.close().await.ok();
        return Ok(true);
    }

    let coordinator = RunCoordinator {
        orchestrator: Orchestrator {
            button_text: config.button_text.clone(),
            success_keywords: config.success_keywords.clone(),
            resolver: ChallengeResolver::new(
                config.challenge_timeout(),
                config.strict_challenge_proof,
            ),
            post_click_settle: Duration::from_secs(2),
            artifact_dir: artifact_dir(),
        },
        target_delay: config.target_delay(),
        delay_jitter: Duration::from_secs(3),
    };

    let report = coordinator.run(&session, &config.targets).await;

    print!("{}", report.render_text());
    if let Some(ref path) = config.report_file {
        report
            .write_to_file(path)
            .with_context(|| format!("could not write report to {}", path))?;
        info!("report written to {}", path);
    }

    session.close().await.ok();
    Ok(report.any_failure())
}
