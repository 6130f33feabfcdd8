use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;

use crate::browser::BrowserSession;
use crate::dom;
use crate::error::{AutomationError, Result};
use crate::task::{Task, TaskOutcome, TaskPayload};

/// Settle time after a navigation, before the page is poked at.
const PAGE_SETTLE_MS: u64 = 1500;
/// Settle time after submitting a form or clicking a submit button.
const SUBMIT_SETTLE_MS: u64 = 3000;
/// How long a single form-field selector strategy may wait before the next
/// strategy is tried.
const FIELD_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Drives one task against a live browser session.
///
/// Everything here is synchronous; the runner wraps execution in
/// `spawn_blocking` so the async side never stalls.
pub struct WebController {
    session: BrowserSession,
}

impl WebController {
    pub fn new(headless: bool, op_timeout: Duration) -> Result<Self> {
        let session = BrowserSession::launch(headless, op_timeout)?;
        Ok(Self { session })
    }

    /// Navigate to the task URL and run its payload.
    pub fn execute(&self, task: &Task) -> Result<TaskOutcome> {
        self.navigate(&task.url)?;
        match &task.payload {
            TaskPayload::FormFill { fields, submit } => self.fill_form(fields, *submit),
            TaskPayload::Extract { selectors } => self.extract(selectors),
            TaskPayload::Click {
                selectors,
                wait_between_ms,
            } => self.click_sequence(selectors, *wait_between_ms),
            TaskPayload::Upload {
                file_selector,
                files,
            } => self.upload(file_selector, files),
        }
    }

    /// PNG screenshot of whatever the page looks like right now.
    pub fn screenshot(&self, path: &Path) -> Result<()> {
        let png = self.session.tab.capture_screenshot(
            CaptureScreenshotFormatOption::Png,
            None,
            None,
            true,
        )?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, png)?;
        Ok(())
    }

    fn navigate(&self, url: &str) -> Result<()> {
        let tab = &self.session.tab;
        tab.navigate_to(url)?;
        tab.wait_for_element("body")?;
        std::thread::sleep(Duration::from_millis(PAGE_SETTLE_MS));
        tracing::debug!(
            url = %dom::current_url(tab)?,
            title = %dom::page_title(tab)?,
            "navigation complete"
        );
        Ok(())
    }

    fn fill_form(&self, fields: &BTreeMap<String, String>, submit: bool) -> Result<TaskOutcome> {
        let mut filled = Vec::new();
        let mut failed = Vec::new();

        for (field, value) in fields {
            match self.fill_one(field, value) {
                Ok(()) => filled.push(field.clone()),
                Err(err) => {
                    tracing::debug!(field = %field, %err, "form field not filled");
                    failed.push(field.clone());
                }
            }
        }

        if filled.is_empty() && !fields.is_empty() {
            return Err(AutomationError::ElementNotFound(failed.join(", ")));
        }

        let submitted = submit && self.submit_form();

        Ok(TaskOutcome::FormFill {
            filled,
            failed,
            submitted,
        })
    }

    /// Find a form field by trying name, id, raw CSS, placeholder, and
    /// aria-label in that order, then clear it and type the value.
    fn fill_one(&self, field: &str, value: &str) -> Result<()> {
        let tab = &self.session.tab;

        let mut matched = None;
        for candidate in selector_candidates(field) {
            if tab
                .wait_for_element_with_custom_timeout(&candidate, FIELD_LOOKUP_TIMEOUT)
                .is_ok()
            {
                matched = Some(candidate);
                break;
            }
        }
        let selector = matched.ok_or_else(|| AutomationError::ElementNotFound(field.to_string()))?;

        let el = tab.find_element(&selector)?;
        el.click()?;
        let js_sel = selector.replace('\'', "\\'");
        tab.evaluate(
            &format!("document.querySelector('{js_sel}').value = ''"),
            false,
        )?;
        tab.type_str(value)?;
        Ok(())
    }

    /// Click an explicit submit control, falling back to Enter in the field
    /// that still has focus.
    fn submit_form(&self) -> bool {
        let tab = &self.session.tab;
        if let Ok(button) = tab.find_element("input[type='submit'], button[type='submit']") {
            if button.click().is_ok() {
                std::thread::sleep(Duration::from_millis(SUBMIT_SETTLE_MS));
                return true;
            }
        }
        if tab.press_key("Enter").is_ok() {
            std::thread::sleep(Duration::from_millis(SUBMIT_SETTLE_MS));
            return true;
        }
        false
    }

    fn extract(&self, selectors: &[String]) -> Result<TaskOutcome> {
        let mut data = BTreeMap::new();
        let mut failed = Vec::new();

        for selector in selectors {
            match dom::extract_elements(&self.session.tab, selector) {
                Ok(elements) => {
                    data.insert(selector.clone(), elements);
                }
                Err(err) => {
                    tracing::warn!(selector = %selector, %err, "extraction failed");
                    failed.push(selector.clone());
                }
            }
        }

        Ok(TaskOutcome::Extract { data, failed })
    }

    fn click_sequence(&self, selectors: &[String], wait_between_ms: u64) -> Result<TaskOutcome> {
        let tab = &self.session.tab;
        let mut clicked = Vec::new();
        let mut failed = Vec::new();

        for selector in selectors {
            let result = tab.wait_for_element(selector).and_then(|el| {
                el.scroll_into_view()?;
                el.click()?;
                Ok(())
            });
            match result {
                Ok(()) => {
                    clicked.push(selector.clone());
                    std::thread::sleep(Duration::from_millis(wait_between_ms));
                }
                Err(err) => {
                    tracing::debug!(selector = %selector, %err, "click failed");
                    failed.push(selector.clone());
                }
            }
        }

        if clicked.is_empty() && !selectors.is_empty() {
            return Err(AutomationError::ElementNotFound(failed.join(", ")));
        }

        Ok(TaskOutcome::Click { clicked, failed })
    }

    fn upload(&self, file_selector: &str, files: &[String]) -> Result<TaskOutcome> {
        let tab = &self.session.tab;
        let input = tab
            .wait_for_element(file_selector)
            .map_err(|_| AutomationError::ElementNotFound(file_selector.to_string()))?;

        let mut uploaded = Vec::new();
        let mut failed = Vec::new();
        for file in files {
            if Path::new(file).exists() {
                uploaded.push(file.clone());
            } else {
                failed.push(format!("{file}: file not found"));
            }
        }

        if uploaded.is_empty() {
            return Err(AutomationError::Upload(format!(
                "no usable files among {}",
                files.join(", ")
            )));
        }

        let paths: Vec<&str> = uploaded.iter().map(String::as_str).collect();
        input.set_input_files(&paths)?;

        Ok(TaskOutcome::Upload { uploaded, failed })
    }
}

fn selector_candidates(field: &str) -> Vec<String> {
    let quoted = field.replace('\'', "\\'");
    vec![
        format!("[name='{quoted}']"),
        format!("#{field}"),
        field.to_string(),
        format!("[placeholder='{quoted}']"),
        format!("[aria-label='{quoted}']"),
    ]
}
