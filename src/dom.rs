use std::sync::Arc;

use headless_chrome::Tab;

use crate::error::Result;
use crate::task::ExtractedElement;

/// Text captured per extracted element is capped at this many characters.
pub const EXTRACT_TEXT_MAX_CHARS: usize = 2000;

/// JavaScript evaluated per selector to snapshot matching elements.
/// Reads text, tag name, and a fixed set of attributes; never mutates the page.
const EXTRACT_JS: &str = r#"
(() => {
  const out = [];
  for (const el of document.querySelectorAll('{selector}')) {
    const attributes = {};
    for (const name of ['href', 'src', 'alt', 'title', 'class', 'id']) {
      const value = el.getAttribute(name);
      if (value) attributes[name] = value;
    }
    out.push({
      text: (el.innerText || el.textContent || '').trim().slice(0, {max_chars}),
      tag: el.tagName.toLowerCase(),
      attributes,
    });
  }
  return JSON.stringify(out);
})()
"#;

/// Snapshot every element matching a CSS selector on the current page.
pub fn extract_elements(tab: &Arc<Tab>, selector: &str) -> Result<Vec<ExtractedElement>> {
    let js_sel = selector.replace('\'', "\\'");
    let script = EXTRACT_JS
        .replace("{selector}", &js_sel)
        .replace("{max_chars}", &EXTRACT_TEXT_MAX_CHARS.to_string());

    let result = tab.evaluate(&script, false)?;
    let raw = result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "[]".to_string());

    Ok(serde_json::from_str(&raw)?)
}

/// Get the current page URL.
pub fn current_url(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate("window.location.href", false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "unknown".to_string()))
}

/// Get the current page title.
pub fn page_title(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate("document.title", false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "untitled".to_string()))
}
