//! Panel authentication.
//!
//! Two ways in: inject the long-lived `remember_web` session cookie (primary,
//! never touches the login form), or fill the login form with email and
//! password (fallback). Either way the session lives in the browser profile
//! afterwards, so the rest of the run just navigates.

use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use thiserror::Error;
use tracing::{info, warn};

use crate::browser::{BrowserError, BrowserSession};
use crate::probes::TargetSurface;

/// Laravel's remember-me cookie for the panel. The suffix is the app-wide
/// hash and is stable across sessions.
const REMEMBER_COOKIE_NAME: &str = "remember_web_59ba36addc2b2f9401580f014c7f58ea4e30989d";

#[derive(Error, Debug)]
pub enum LoginError {
    #[error("browser error during login: {0}")]
    Browser(#[from] BrowserError),

    #[error("cookie rejected: {0}")]
    CookieRejected(String),

    #[error("login form rejected the credentials")]
    BadCredentials,

    #[error("no credentials configured: set REMEMBER_WEB_COOKIE or WEIRDHOST_EMAIL/WEIRDHOST_PASSWORD")]
    NoCredentials,

    #[error("invalid panel url: {0}")]
    BadUrl(String),
}

/// Credentials for one of the two login paths.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub remember_cookie: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn has_any(&self) -> bool {
        self.remember_cookie.is_some() || (self.email.is_some() && self.password.is_some())
    }
}

/// Authenticate the session. Tries the cookie first, then the form.
pub async fn login(
    session: &BrowserSession,
    base_url: &str,
    login_url: &str,
    credentials: &Credentials,
) -> Result<(), LoginError> {
    if let Some(ref cookie) = credentials.remember_cookie {
        match login_with_cookie(session, base_url, cookie).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if credentials.email.is_none() {
                    return Err(e);
                }
                warn!("cookie login failed ({}), falling back to password", e);
            }
        }
    }

    match (&credentials.email, &credentials.password) {
        (Some(email), Some(password)) => {
            login_with_password(session, base_url, login_url, email, password).await
        }
        _ => Err(LoginError::NoCredentials),
    }
}

/// Primary path: inject the remember-me cookie, then navigate and verify the
/// panel did not bounce us to the login page.
pub async fn login_with_cookie(
    session: &BrowserSession,
    base_url: &str,
    cookie_value: &str,
) -> Result<(), LoginError> {
    let parsed = url::Url::parse(base_url).map_err(|e| LoginError::BadUrl(e.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| LoginError::BadUrl(format!("no host in {}", base_url)))?;

    info!("logging in with remember-me cookie (domain {})", host);

    let page = session.open_page().await?;
    let result = async {
        let cookie = CookieParam::builder()
            .name(REMEMBER_COOKIE_NAME)
            .value(cookie_value)
            .domain(host)
            .path("/")
            .secure(true)
            .http_only(true)
            .build()
            .map_err(LoginError::CookieRejected)?;

        page.set_cookie(cookie)
            .await
            .map_err(|e| LoginError::CookieRejected(e.to_string()))?;

        page.goto(base_url).await?;
        verify_logged_in(&page).await
    }
    .await;

    page.close().await;
    result
}

/// Fallback path: drive the login form.
pub async fn login_with_password(
    session: &BrowserSession,
    base_url: &str,
    login_url: &str,
    email: &str,
    password: &str,
) -> Result<(), LoginError> {
    info!("logging in with email/password via {}", login_url);

    let page = session.open_page().await?;
    let result = async {
        page.goto(login_url).await?;

        page.fill_login_form(email, password).await?;
        page.submit_login_form().await?;

        // The panel redirects off /login on success; give it a moment.
        tokio::time::sleep(Duration::from_secs(3)).await;

        page.goto(base_url).await?;
        verify_logged_in(&page).await
    }
    .await;

    page.close().await;
    result
}

async fn verify_logged_in(page: &crate::browser::RenewPage) -> Result<(), LoginError> {
    let current = page.current_url().await?;
    if current.contains("/login") || current.contains("/auth") {
        return Err(LoginError::BadCredentials);
    }
    info!("authenticated, landed on {}", current);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_presence() {
        assert!(!Credentials::default().has_any());
        assert!(Credentials {
            remember_cookie: Some("tok".into()),
            ..Default::default()
        }
        .has_any());
        assert!(!Credentials {
            email: Some("a@b.c".into()),
            password: None,
            remember_cookie: None,
        }
        .has_any());
    }

    #[test]
    fn remember_cookie_name_is_the_panel_hash() {
        assert!(REMEMBER_COOKIE_NAME.starts_with("remember_web_"));
        assert_eq!(REMEMBER_COOKIE_NAME.len(), "remember_web_".len() + 40);
    }
}
