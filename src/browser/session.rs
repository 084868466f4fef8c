//! Browser session management
//!
//! Handles launching and controlling the Chrome browser instance that holds
//! the authenticated panel session. One browser per run; each target gets a
//! fresh tab through [`SurfaceProvider`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::handler::viewport::Viewport;
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::page::{PageSettings, RenewPage};
use super::BrowserError;
use crate::probes::{SurfaceProvider, TargetSurface};

/// Find Chrome/Chromium executable on the system
fn find_chrome() -> Option<std::path::PathBuf> {
    let candidates: Vec<std::path::PathBuf> = if cfg!(target_os = "windows") {
        let mut paths = vec![
            std::path::PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            std::path::PathBuf::from(
                r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            ),
        ];
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            paths.push(std::path::PathBuf::from(format!(
                r"{}\Google\Chrome\Application\chrome.exe",
                local
            )));
        }
        paths
    } else if cfg!(target_os = "macos") {
        vec![std::path::PathBuf::from(
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        )]
    } else {
        // Chromium MUST come first: Google Chrome blocks --load-extension
        // of unpacked extensions, which we need for the challenge solver
        vec![
            std::path::PathBuf::from("/usr/bin/chromium"),
            std::path::PathBuf::from("/usr/bin/chromium-browser"),
            std::path::PathBuf::from("/usr/bin/google-chrome"),
            std::path::PathBuf::from("/usr/bin/google-chrome-stable"),
        ]
    };

    candidates.into_iter().find(|p| p.exists())
}

/// Configuration for the browser session
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserSessionConfig {
    /// Path to Chrome/Chromium executable
    pub chrome_path: Option<String>,
    /// Run in headless mode
    pub headless: bool,
    /// Path to the unpacked challenge-solver extension directory
    pub solver_extension_dir: Option<String>,
    /// Navigation timeout in seconds
    pub nav_timeout_secs: u64,
    /// Window width
    pub window_width: u32,
    /// Window height
    pub window_height: u32,
}

impl Default for BrowserSessionConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: true,
            solver_extension_dir: None,
            nav_timeout_secs: 60,
            window_width: 1920,
            window_height: 1080,
        }
    }
}

impl BrowserSessionConfig {
    /// Set headless mode
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Set Chrome path
    pub fn chrome_path(mut self, path: Option<String>) -> Self {
        self.chrome_path = path;
        self
    }

    /// Set solver extension directory
    pub fn solver_extension(mut self, dir: Option<String>) -> Self {
        self.solver_extension_dir = dir;
        self
    }

    /// Set navigation timeout
    pub fn nav_timeout(mut self, secs: u64) -> Self {
        self.nav_timeout_secs = secs;
        self
    }

    /// Find the challenge-solver extension directory.
    /// Searches in order: next to executable, current working directory.
    pub fn find_solver_extension() -> Option<String> {
        let candidates = vec![
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|d| d.join("extensions").join("captcha-solver"))),
            Some(std::path::PathBuf::from("extensions/captcha-solver")),
        ];

        for candidate in candidates.into_iter().flatten() {
            if candidate.join("manifest.json").exists() {
                if let Some(path_str) = candidate.to_str() {
                    info!("Found challenge-solver extension at: {}", path_str);
                    return Some(path_str.to_string());
                }
            }
        }

        debug!("Challenge-solver extension not found in any search path");
        None
    }
}

/// The browser session carrying the authenticated panel state
pub struct BrowserSession {
    /// The browser instance
    browser: Arc<RwLock<Option<Browser>>>,
    /// Per-tab settings handed to every surface this session opens
    page_settings: PageSettings,
    /// Whether the session is alive
    alive: Arc<AtomicBool>,
    config: BrowserSessionConfig,
}

impl BrowserSession {
    /// Launch the browser with the given config
    pub async fn launch(
        config: BrowserSessionConfig,
        page_settings: PageSettings,
    ) -> Result<Self, BrowserError> {
        info!("Launching browser session (headless: {})", config.headless);

        // Check if Chrome is available before attempting launch
        let chrome_path = config
            .chrome_path
            .clone()
            .map(std::path::PathBuf::from)
            .or_else(find_chrome)
            .ok_or_else(|| {
                BrowserError::LaunchFailed(
                    "No Chrome/Chromium binary found. Install Chromium or set CHROME_PATH.".into(),
                )
            })?;
        info!("Using browser binary: {}", chrome_path.display());

        let mut builder = BrowserConfig::builder()
            .chrome_executable(&chrome_path)
            .viewport(Viewport {
                width: config.window_width,
                height: config.window_height,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: true,
                has_touch: false,
            })
            .window_size(config.window_width, config.window_height)
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--disable-translate")
            .arg("--mute-audio")
            .arg(
                "--user-agent=Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
                 AppleWebKit/537.36 Chrome/120 Safari/537.36",
            );

        if !config.headless {
            builder = builder.with_head();
        }

        // The solver extension resolves the Turnstile out-of-band; loading it
        // here is the whole challenge-solving capability in extension mode.
        if let Some(ref ext_dir) = config.solver_extension_dir {
            info!("Loading challenge-solver extension from: {}", ext_dir);
            builder = builder.extension(ext_dir.clone());
        }

        let browser_config = builder
            .build()
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        // Spawn handler in background - when it ends, Chrome has disconnected
        let alive_flag = Arc::new(AtomicBool::new(true));
        let alive_for_handler = alive_flag.clone();
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("browser handler event error: {}", e);
                }
            }
            warn!("Chrome disconnected (event handler ended)");
            alive_for_handler.store(false, Ordering::Relaxed);
        });

        Ok(Self {
            browser: Arc::new(RwLock::new(Some(browser))),
            page_settings,
            alive: alive_flag,
            config,
        })
    }

    /// Check if the session is alive
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn nav_timeout(&self) -> Duration {
        Duration::from_secs(self.config.nav_timeout_secs)
    }

    /// Open a fresh tab wired up as a renewal surface.
    pub async fn open_page(&self) -> Result<RenewPage, BrowserError> {
        if !self.is_alive() {
            return Err(BrowserError::ConnectionLost("browser has exited".into()));
        }

        let browser = self.browser.read().await;
        let browser = browser
            .as_ref()
            .ok_or_else(|| BrowserError::ConnectionLost("browser already closed".into()))?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::ConnectionLost(e.to_string()))?;

        RenewPage::attach(page, self.page_settings.clone()).await
    }

    /// Close the browser session
    pub async fn close(&self) -> Result<(), BrowserError> {
        self.alive.store(false, Ordering::Relaxed);

        let mut browser = self.browser.write().await;
        if let Some(mut b) = browser.take() {
            // Graceful close first, brief grace period, then force kill so no
            // Chrome child processes linger
            let _ = b.close().await;
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = b.kill().await;
        }

        info!("Browser session closed");
        Ok(())
    }
}

#[async_trait]
impl SurfaceProvider for BrowserSession {
    async fn open_surface(&self) -> Result<Box<dyn TargetSurface>, BrowserError> {
        let page = self.open_page().await?;
        Ok(Box::new(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder_chains() {
        let cfg = BrowserSessionConfig::default()
            .headless(false)
            .nav_timeout(30)
            .chrome_path(Some("/usr/bin/chromium".into()));
        assert!(!cfg.headless);
        assert_eq!(cfg.nav_timeout_secs, 30);
        assert_eq!(cfg.chrome_path.as_deref(), Some("/usr/bin/chromium"));
    }

    #[test]
    fn missing_extension_dir_is_none() {
        // Search paths are relative to a test binary; nothing should match.
        assert!(BrowserSessionConfig::find_solver_extension().is_none()
            || std::path::Path::new("extensions/captcha-solver/manifest.json").exists());
    }
}
