use std::sync::Arc;
use std::time::Duration;

use headless_chrome::{Browser, LaunchOptions, Tab};

use crate::error::Result;

/// Browser session for a single task run. Launched fresh per run and dropped
/// when the run ends.
pub struct BrowserSession {
    _browser: Browser,
    pub tab: Arc<Tab>,
}

impl BrowserSession {
    /// Launch Chrome and open a blank tab. `op_timeout` becomes the default
    /// wait bound for every tab operation.
    pub fn launch(headless: bool, op_timeout: Duration) -> Result<Self> {
        let options = LaunchOptions {
            headless,
            sandbox: false,
            args: vec![
                std::ffi::OsStr::new("--no-first-run"),
                std::ffi::OsStr::new("--no-default-browser-check"),
                std::ffi::OsStr::new("--disable-dev-shm-usage"),
                std::ffi::OsStr::new("--disable-gpu"),
                std::ffi::OsStr::new("--disable-extensions"),
            ],
            idle_browser_timeout: op_timeout.max(Duration::from_secs(60)),
            ..Default::default()
        };

        let browser = Browser::new(options)?;
        let tab = browser.new_tab()?;
        tab.set_default_timeout(op_timeout);
        tab.navigate_to("about:blank")?;

        Ok(Self {
            _browser: browser,
            tab,
        })
    }
}
