//! Weirdhost Renew
//!
//! Automated renewal bot for hub.weirdhost.xyz: logs in with a remembered
//! session cookie (or email/password), opens each configured server page,
//! clicks the renew button, waits out the Cloudflare Turnstile interstitial
//! and classifies whether the renewal actually went through.

pub mod auth;
pub mod browser;
pub mod challenge;
pub mod classify;
pub mod orchestrator;
pub mod probes;
pub mod runner;

use std::path::PathBuf;
use std::time::Duration;

/// One independently-processed server whose renew button must be clicked.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Target {
    /// Short identifier (last path segment of the URL).
    pub id: String,
    /// Full server page URL.
    pub url: String,
}

impl Target {
    pub fn from_url(url: &str) -> Self {
        let id = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(url)
            .to_string();
        Self {
            id,
            url: url.to_string(),
        }
    }
}

/// Application configuration, built once from the environment at startup.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Panel base URL
    pub base_url: String,
    /// Login page URL
    pub login_url: String,
    /// Server pages to renew
    pub targets: Vec<Target>,

    /// Long-lived remember-me session token (cookie login)
    pub remember_web_cookie: String,
    /// Email/password fallback
    pub email: String,
    pub password: String,

    /// Run Chrome headless
    pub headless: bool,
    /// Explicit Chrome binary (auto-discovered when unset)
    pub chrome_path: Option<String>,
    /// Unpacked challenge-solver extension directory
    pub solver_extension_dir: Option<String>,

    /// Strings that prove the renewal succeeded
    pub success_keywords: Vec<String>,
    /// Strings that mean the renewal was already done today
    pub already_keywords: Vec<String>,
    /// Visible label of the renew button
    pub button_text: String,
    /// Substring matching the renew backend route
    pub endpoint_pattern: String,

    /// Challenge wait budget in seconds
    pub challenge_timeout_secs: u64,
    /// Navigation budget in seconds
    pub nav_timeout_secs: u64,
    /// Mandatory spacing between targets in seconds
    pub target_delay_secs: u64,

    /// Require a completion marker (token/cookie) as challenge proof;
    /// widget disappearance alone is not accepted
    pub strict_challenge_proof: bool,

    /// Optional human-readable report file
    pub report_file: Option<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    env_or(key, default)
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_secs(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for AppConfig {
    fn default() -> Self {
        let base_url = "https://hub.weirdhost.xyz".to_string();
        Self {
            login_url: format!("{}/auth/login", base_url),
            base_url,
            targets: vec![],
            remember_web_cookie: String::new(),
            email: String::new(),
            password: String::new(),
            headless: true,
            chrome_path: None,
            solver_extension_dir: None,
            success_keywords: vec![
                "시간이 추가".to_string(),
                "추가되었습니다".to_string(),
                "success".to_string(),
                "added".to_string(),
            ],
            already_keywords: vec![
                "이미".to_string(),
                "already".to_string(),
                "오늘은".to_string(),
            ],
            button_text: "시간 추가".to_string(),
            endpoint_pattern: "renew".to_string(),
            challenge_timeout_secs: 120,
            nav_timeout_secs: 60,
            target_delay_secs: 10,
            strict_challenge_proof: false,
            report_file: None,
        }
    }
}

impl AppConfig {
    /// Build the configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let base_url = env_or("WEIRDHOST_URL", &defaults.base_url);
        let login_url = env_or("WEIRDHOST_LOGIN_URL", &format!("{}/auth/login", base_url));

        let targets = env_list("WEIRDHOST_SERVER_URLS", "")
            .iter()
            .map(|u| Target::from_url(u))
            .collect();

        Self {
            base_url,
            login_url,
            targets,
            remember_web_cookie: env_or("REMEMBER_WEB_COOKIE", ""),
            email: env_or("WEIRDHOST_EMAIL", ""),
            password: env_or("WEIRDHOST_PASSWORD", ""),
            headless: env_or("HEADLESS", "true").to_lowercase() == "true",
            chrome_path: std::env::var("CHROME_PATH").ok(),
            solver_extension_dir: std::env::var("SOLVER_EXTENSION_DIR").ok(),
            success_keywords: env_list(
                "RENEW_SUCCESS_KEYWORDS",
                "시간이 추가,추가되었습니다,success,added",
            ),
            already_keywords: env_list("RENEW_ALREADY_KEYWORDS", "이미,already,오늘은"),
            button_text: env_or("RENEW_BUTTON_TEXT", &defaults.button_text),
            endpoint_pattern: env_or("RENEW_ENDPOINT_PATTERN", &defaults.endpoint_pattern),
            challenge_timeout_secs: env_secs("CHALLENGE_TIMEOUT_SECS", 120),
            nav_timeout_secs: env_secs("NAV_TIMEOUT_SECS", 60),
            target_delay_secs: env_secs("TARGET_DELAY_SECS", 10),
            strict_challenge_proof: env_or("STRICT_CHALLENGE_PROOF", "false").to_lowercase()
                == "true",
            report_file: std::env::var("REPORT_FILE").ok(),
        }
    }

    /// True when some way of authenticating is configured.
    pub fn has_auth(&self) -> bool {
        !self.remember_web_cookie.is_empty()
            || (!self.email.is_empty() && !self.password.is_empty())
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout_secs)
    }

    pub fn nav_timeout(&self) -> Duration {
        Duration::from_secs(self.nav_timeout_secs)
    }

    pub fn target_delay(&self) -> Duration {
        Duration::from_secs(self.target_delay_secs)
    }
}

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("weirdhost-renew").join("logs"))
}

/// Directory for diagnostic screenshots captured on failing targets.
pub fn artifact_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("weirdhost-renew").join("artifacts"))
        .unwrap_or_else(|| std::env::temp_dir().join("weirdhost-renew-artifacts"))
}

/// Initialize logging: console layer plus a daily-rolling file layer.
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "weirdhost-renew.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_id_is_last_path_segment() {
        let t = Target::from_url("https://hub.weirdhost.xyz/server/abc123");
        assert_eq!(t.id, "abc123");

        let t = Target::from_url("https://hub.weirdhost.xyz/server/abc123/");
        assert_eq!(t.id, "abc123");
    }

    #[test]
    fn default_config_has_no_auth() {
        let cfg = AppConfig::default();
        assert!(!cfg.has_auth());
        assert_eq!(cfg.target_delay(), Duration::from_secs(10));
    }
}
