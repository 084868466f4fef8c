//! Browser capability layer.
//!
//! Launching and controlling the Chrome/Chromium instance that carries the
//! authenticated panel session, and the per-tab surface the renewal state
//! machine drives.

mod errors;
mod page;
mod session;

pub use errors::BrowserError;
pub use page::{PageSettings, RenewPage};
pub use session::{BrowserSession, BrowserSessionConfig};
