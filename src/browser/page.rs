//! The per-target page surface.
//!
//! Wraps one Chrome tab and exposes the read-only signal probes plus the
//! handful of actions the renewal state machine needs. All JavaScript
//! evaluation is bounded by a timeout so a wedged renderer can never hang a
//! probe poll.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::cdp::browser_protocol::network::{EventResponseReceived, GetResponseBodyParams};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::BrowserError;
use crate::probes::{
    fingerprint_text, text_contains_any, BackendResponse, ControlProbe, ControlStrategy,
    SignalProbes, TargetSurface,
};

/// Selector for the control once a strategy has matched it. The matching
/// strategy tags the element so click and disabled-probes address the same
/// node the probe saw. Tag-agnostic: strategies match anchors as well as
/// buttons.
const MARKED_CONTROL: &str = "[data-renew-target=\"1\"]";

/// Substring identifying a Turnstile challenge iframe.
const CHALLENGE_FRAME_HOST: &str = "challenges.cloudflare.com";

/// Hidden input Turnstile fills with the response token on completion.
const CHALLENGE_TOKEN_INPUT: &str = "cf-turnstile-response";

/// Clearance cookie Cloudflare sets once the challenge has been passed.
const CLEARANCE_COOKIE: &str = "cf_clearance";

/// Per-tab knobs shared by every surface a session opens.
#[derive(Debug, Clone)]
pub struct PageSettings {
    pub success_keywords: Vec<String>,
    pub already_keywords: Vec<String>,
    /// Visible label of the renew button, for re-locating the control.
    pub button_text: String,
    /// Substring of the renew backend route, e.g. `/renew`.
    pub endpoint_pattern: String,
    pub nav_timeout: Duration,
    /// Upper bound for any single JS evaluation.
    pub eval_timeout: Duration,
}

impl Default for PageSettings {
    fn default() -> Self {
        Self {
            success_keywords: Vec::new(),
            already_keywords: Vec::new(),
            button_text: "시간 추가".to_string(),
            endpoint_pattern: "/renew".to_string(),
            nav_timeout: Duration::from_secs(60),
            eval_timeout: Duration::from_secs(10),
        }
    }
}

/// One tab, wired with a network recorder for the renew backend route.
pub struct RenewPage {
    page: Page,
    settings: PageSettings,
    /// Most recent matching backend response, written by the recorder task.
    backend: Arc<Mutex<Option<BackendResponse>>>,
    recorder: Option<JoinHandle<()>>,
}

impl RenewPage {
    /// Wire up the tab: start the response recorder before anything loads so
    /// no backend response can slip past it.
    pub async fn attach(page: Page, settings: PageSettings) -> Result<Self, BrowserError> {
        let backend = Arc::new(Mutex::new(None));
        let recorder = Self::spawn_recorder(&page, &settings.endpoint_pattern, backend.clone())
            .await
            .map_err(|e| BrowserError::ConnectionLost(e.to_string()))?;

        Ok(Self {
            page,
            settings,
            backend,
            recorder: Some(recorder),
        })
    }

    async fn spawn_recorder(
        page: &Page,
        endpoint_pattern: &str,
        backend: Arc<Mutex<Option<BackendResponse>>>,
    ) -> Result<JoinHandle<()>, chromiumoxide::error::CdpError> {
        let mut responses = page.event_listener::<EventResponseReceived>().await?;
        let page = page.clone();
        let pattern = endpoint_pattern.to_string();

        Ok(tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                let url = event.response.url.clone();
                if pattern.is_empty() || !url.contains(&pattern) {
                    continue;
                }
                let status = event.response.status as u16;
                debug!("renew backend answered {} for {}", status, url);

                // Body fetch can fail for responses without one (204, cached);
                // the status alone is still a usable signal.
                let body = match page
                    .execute(GetResponseBodyParams::new(event.request_id.clone()))
                    .await
                {
                    Ok(resp) => {
                        if resp.result.base64_encoded {
                            base64::engine::general_purpose::STANDARD
                                .decode(&resp.result.body)
                                .ok()
                                .and_then(|raw| String::from_utf8(raw).ok())
                                .unwrap_or_default()
                        } else {
                            resp.result.body.clone()
                        }
                    }
                    Err(e) => {
                        trace!("no response body for {}: {}", url, e);
                        String::new()
                    }
                };

                *backend.lock().await = Some(BackendResponse { status, body, url });
            }
        }))
    }

    /// Evaluate JS with a hard timeout. Returns the deserialized value, or
    /// `None` on timeout, eval error or type mismatch.
    async fn eval<T: serde::de::DeserializeOwned>(&self, js: &str) -> Option<T> {
        match tokio::time::timeout(self.settings.eval_timeout, self.page.evaluate(js)).await {
            Ok(Ok(value)) => value.into_value::<T>().ok(),
            Ok(Err(e)) => {
                trace!("js eval failed: {}", e);
                None
            }
            Err(_) => {
                warn!("js eval timed out after {:?}", self.settings.eval_timeout);
                None
            }
        }
    }

    async fn eval_bool(&self, js: &str) -> bool {
        self.eval::<bool>(js).await.unwrap_or(false)
    }

    async fn body_text(&self) -> String {
        self.eval::<String>("document.body ? document.body.innerText : ''")
            .await
            .unwrap_or_default()
    }

    /// Challenge response token filled in by the widget (or the solver
    /// extension) on completion.
    async fn challenge_token_present(&self) -> bool {
        let js = format!(
            r#"(function() {{
                var inputs = document.querySelectorAll('input[name="{}"]');
                for (var i = 0; i < inputs.length; i++) {{
                    if (inputs[i].value && inputs[i].value.length > 0) return true;
                }}
                return false;
            }})()"#,
            CHALLENGE_TOKEN_INPUT
        );
        self.eval_bool(&js).await
    }

    async fn clearance_cookie_present(&self) -> bool {
        match self.page.get_cookies().await {
            Ok(cookies) => cookies.iter().any(|c| c.name == CLEARANCE_COOKIE),
            Err(e) => {
                trace!("cookie read failed: {}", e);
                false
            }
        }
    }

    /// Close the underlying tab. The surface is unusable afterwards.
    pub async fn close(&self) {
        if let Some(recorder) = &self.recorder {
            recorder.abort();
        }
        if let Err(e) = self.page.clone().close().await {
            trace!("tab close failed (ignored): {}", e);
        }
    }

    pub async fn set_cookie(
        &self,
        cookie: chromiumoxide::cdp::browser_protocol::network::CookieParam,
    ) -> Result<(), BrowserError> {
        self.page
            .set_cookie(cookie)
            .await
            .map_err(|e| BrowserError::ConnectionLost(e.to_string()))?;
        Ok(())
    }

    pub async fn current_url(&self) -> Result<String, BrowserError> {
        let url = self
            .page
            .url()
            .await
            .map_err(|e| BrowserError::ConnectionLost(e.to_string()))?;
        url.ok_or_else(|| BrowserError::NavigationFailed("page has no url".into()))
    }

    /// Fill the panel login form. Dispatches input events so the frontend
    /// framework picks up the values.
    pub async fn fill_login_form(&self, email: &str, password: &str) -> Result<(), BrowserError> {
        let js = format!(
            r#"(function() {{
                var email = document.querySelector('input[type="email"], input[name="username"], input[name="email"]');
                var password = document.querySelector('input[type="password"]');
                if (!email || !password) return false;
                var setter = Object.getOwnPropertyDescriptor(window.HTMLInputElement.prototype, 'value').set;
                setter.call(email, {});
                email.dispatchEvent(new Event('input', {{bubbles: true}}));
                setter.call(password, {});
                password.dispatchEvent(new Event('input', {{bubbles: true}}));
                return true;
            }})()"#,
            json_string(email),
            json_string(password)
        );
        if self.eval_bool(&js).await {
            Ok(())
        } else {
            Err(BrowserError::ElementNotFound("login form fields".into()))
        }
    }

    pub async fn submit_login_form(&self) -> Result<(), BrowserError> {
        let js = r#"(function() {
            var button = document.querySelector('button[type="submit"], form button');
            if (!button) return false;
            button.click();
            return true;
        })()"#;
        if self.eval_bool(js).await {
            Ok(())
        } else {
            Err(BrowserError::ElementNotFound("login submit button".into()))
        }
    }

    /// JS expression locating the control for one strategy and reporting its
    /// state. A hit tags the element so later calls address the same node.
    fn strategy_js(strategy: &ControlStrategy) -> String {
        let finder = match strategy {
            ControlStrategy::ExactText(label) => format!(
                r#"var label = {};
                    var candidates = document.querySelectorAll('button, a[role="button"]');
                    var el = null;
                    for (var i = 0; i < candidates.length; i++) {{
                        if ((candidates[i].innerText || '').trim() === label) {{ el = candidates[i]; break; }}
                    }}"#,
                json_string(label)
            ),
            ControlStrategy::SubstringText(label) => format!(
                r#"var label = {};
                    var candidates = document.querySelectorAll('button, a[role="button"]');
                    var el = null;
                    for (var i = 0; i < candidates.length; i++) {{
                        if ((candidates[i].innerText || '').indexOf(label) !== -1) {{ el = candidates[i]; break; }}
                    }}"#,
                json_string(label)
            ),
            ControlStrategy::Attribute(selector) => {
                format!("var el = document.querySelector({});", json_string(selector))
            }
        };

        format!(
            r#"(function() {{
                {finder}
                var old = document.querySelectorAll('[data-renew-target]');
                for (var j = 0; j < old.length; j++) old[j].removeAttribute('data-renew-target');
                if (!el) return 'missing';
                el.setAttribute('data-renew-target', '1');
                var style = window.getComputedStyle(el);
                var visible = el.offsetWidth > 0 && el.offsetHeight > 0 &&
                              style.display !== 'none' && style.visibility !== 'hidden';
                if (!visible) return 'missing';
                if (el.disabled || el.getAttribute('aria-disabled') === 'true' ||
                    el.classList.contains('disabled')) return 'disabled';
                return 'ready';
            }})()"#
        )
    }
}

impl Drop for RenewPage {
    fn drop(&mut self) {
        if let Some(recorder) = self.recorder.take() {
            recorder.abort();
        }
    }
}

#[async_trait]
impl SignalProbes for RenewPage {
    async fn challenge_widget_present(&self) -> bool {
        let js = format!(
            r#"(function() {{
                var frames = document.querySelectorAll('iframe[src*="{}"]');
                for (var i = 0; i < frames.length; i++) {{
                    var f = frames[i];
                    if (f.offsetWidth > 0 && f.offsetHeight > 0) return true;
                }}
                return false;
            }})()"#,
            CHALLENGE_FRAME_HOST
        );
        self.eval_bool(&js).await
    }

    async fn challenge_widget_cleared(&self) -> bool {
        if self.challenge_marker_present().await {
            return true;
        }
        !self.challenge_widget_present().await
    }

    async fn challenge_marker_present(&self) -> bool {
        if self.challenge_token_present().await {
            return true;
        }
        self.clearance_cookie_present().await
    }

    async fn success_text_present(&self) -> bool {
        let text = self.body_text().await;
        text_contains_any(&text, &self.settings.success_keywords)
    }

    async fn already_done_text_present(&self) -> bool {
        let text = self.body_text().await;
        text_contains_any(&text, &self.settings.already_keywords)
    }

    async fn control_disabled_or_absent(&self) -> bool {
        let js = format!(
            r#"(function() {{
                var el = document.querySelector('{}');
                if (!el) return 'missing';
                if (el.offsetWidth === 0 && el.offsetHeight === 0) return 'missing';
                if (el.disabled || el.getAttribute('aria-disabled') === 'true') return 'disabled';
                return 'ready';
            }})()"#,
            MARKED_CONTROL
        );
        match probe_from_state(self.eval::<String>(&js).await.as_deref()) {
            ControlProbe::Ready => false,
            ControlProbe::Disabled => true,
            ControlProbe::Missing => {
                // A framework re-render can drop the tag without removing the
                // button. Re-locate before concluding the control is gone.
                for strategy in ControlStrategy::ordered(&self.settings.button_text) {
                    match self.query_control(&strategy).await {
                        ControlProbe::Ready => return false,
                        ControlProbe::Disabled => return true,
                        ControlProbe::Missing => {}
                    }
                }
                true
            }
        }
    }

    async fn backend_response(&self) -> Option<BackendResponse> {
        self.backend.lock().await.clone()
    }

    async fn page_fingerprint(&self) -> u64 {
        fingerprint_text(&self.body_text().await)
    }
}

#[async_trait]
impl TargetSurface for RenewPage {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        let nav = async {
            self.page
                .goto(url)
                .await
                .map_err(|e| BrowserError::NavigationFailed(e.to_string()))?;
            // wait_for_navigation errors when the load event already fired;
            // the page is usable either way
            let _ = self.page.wait_for_navigation().await;
            Ok::<(), BrowserError>(())
        };

        match tokio::time::timeout(self.settings.nav_timeout, nav).await {
            Ok(result) => result,
            Err(_) => Err(BrowserError::Timeout(format!(
                "navigation to {} exceeded {:?}",
                url, self.settings.nav_timeout
            ))),
        }
    }

    async fn query_control(&self, strategy: &ControlStrategy) -> ControlProbe {
        let js = Self::strategy_js(strategy);
        probe_from_state(self.eval::<String>(&js).await.as_deref())
    }

    async fn click_control(&self) -> Result<(), BrowserError> {
        let element = self
            .page
            .find_element(MARKED_CONTROL)
            .await
            .map_err(|e| BrowserError::ElementNotFound(e.to_string()))?;

        let _ = element.scroll_into_view().await;
        element
            .click()
            .await
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;
        Ok(())
    }

    async fn dispatch_click_js(&self) -> Result<(), BrowserError> {
        let js = format!(
            r#"(function() {{
                var el = document.querySelector('{}');
                if (!el) return false;
                el.scrollIntoView({{block: 'center'}});
                el.dispatchEvent(new MouseEvent('click', {{bubbles: true, cancelable: true, view: window}}));
                return true;
            }})()"#,
            MARKED_CONTROL
        );
        if self.eval_bool(&js).await {
            Ok(())
        } else {
            Err(BrowserError::JavaScriptError(
                "dispatch target vanished before the fallback click".into(),
            ))
        }
    }

    async fn nudge_challenge(&self) -> anyhow::Result<()> {
        // A plain click on the widget container is enough to wake an
        // interactive Turnstile; when the solver extension drives the
        // challenge this is a harmless no-op.
        let js = format!(
            r#"(function() {{
                var frames = document.querySelectorAll('iframe[src*="{}"]');
                if (frames.length === 0) return false;
                var box = frames[0].parentElement || frames[0];
                box.scrollIntoView({{block: 'center'}});
                box.click();
                return true;
            }})()"#,
            CHALLENGE_FRAME_HOST
        );
        if self.eval_bool(&js).await {
            Ok(())
        } else {
            anyhow::bail!("no challenge widget to nudge")
        }
    }

    async fn close(&self) {
        RenewPage::close(self).await;
    }

    async fn screenshot(&self, path: &Path) -> Result<(), BrowserError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        self.page
            .save_screenshot(params, path)
            .await
            .map_err(|e| BrowserError::ScreenshotFailed(e.to_string()))?;
        Ok(())
    }
}

/// JSON-encode a string for safe embedding in a JS source snippet.
fn json_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Map the state string the locate/disabled JS returns onto a probe result.
/// Anything unexpected (eval failure, timeout) reads as missing.
fn probe_from_state(state: Option<&str>) -> ControlProbe {
    match state {
        Some("ready") => ControlProbe::Ready,
        Some("disabled") => ControlProbe::Disabled,
        _ => ControlProbe::Missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_js_escapes_labels() {
        let js = RenewPage::strategy_js(&ControlStrategy::ExactText("시간 \"추가\"".into()));
        assert!(js.contains("시간 \\\"추가\\\""));
        assert!(js.contains("data-renew-target"));
    }

    #[test]
    fn attribute_strategy_uses_query_selector() {
        let js =
            RenewPage::strategy_js(&ControlStrategy::Attribute("button[data-action=\"renew\"]".into()));
        assert!(js.contains("document.querySelector"));
        assert!(js.contains("data-action"));
    }

    #[test]
    fn default_settings_are_bounded() {
        let s = PageSettings::default();
        assert!(s.eval_timeout < s.nav_timeout);
        assert_eq!(s.endpoint_pattern, "/renew");
        assert!(!s.button_text.is_empty());
    }

    #[test]
    fn marked_selector_addresses_any_element_the_strategies_match() {
        // Strategies match anchors as well as buttons; the invoke/disabled
        // selector must not be narrower than the locate set.
        let js = RenewPage::strategy_js(&ControlStrategy::SubstringText("renew".into()));
        assert!(js.contains("a[role=\"button\"]"));
        assert!(MARKED_CONTROL.starts_with('['));
        assert!(js.contains("data-renew-target"));
    }

    #[test]
    fn control_state_strings_map_to_probes() {
        assert_eq!(probe_from_state(Some("ready")), ControlProbe::Ready);
        assert_eq!(probe_from_state(Some("disabled")), ControlProbe::Disabled);
        assert_eq!(probe_from_state(Some("missing")), ControlProbe::Missing);
        assert_eq!(probe_from_state(Some("garbage")), ControlProbe::Missing);
        assert_eq!(probe_from_state(None), ControlProbe::Missing);
    }
}
