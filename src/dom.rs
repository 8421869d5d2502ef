use anyhow::Result;
use headless_chrome::Tab;
use std::sync::Arc;

use crate::types::DOM_SNAPSHOT_MAX_CHARS;

/// JavaScript injected into the page to produce a simplified DOM representation.
/// Read-only apart from tagging interactive elements with `data-eid`.
///
/// Interactive elements (a, button, input, textarea, select) get sequential
/// ids `[e0]`, `[e1]`, ... Links carry their href so the planner can tell a
/// document link from navigation. The whole page is walked, not only the
/// viewport, so one snapshot shows every download affordance.
const SNAPSHOT_JS: &str = r#"
(() => {
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','SVG','LINK','META']);
  const DOC_HINT = /(\.pdf|download|brochure|package|memorandum|flyer|\bom\b)/i;
  let id = 0;
  const lines = [];
  const seen = new Set();

  function hidden(el) {
    const s = getComputedStyle(el);
    return s.display === 'none' || s.visibility === 'hidden';
  }

  function label(el) {
    return (el.innerText || el.value || el.getAttribute('aria-label') || '').trim().replace(/\s+/g, ' ').slice(0, 80);
  }

  function walk(node, depth) {
    if (depth > 25) return;
    for (const child of node.children) {
      if (SKIP.has(child.tagName) || hidden(child)) continue;
      const tag = child.tagName.toLowerCase();

      if (['a','button','input','textarea','select'].includes(tag)) {
        const eid = '[e' + (id++) + ']';
        child.setAttribute('data-eid', eid);
        let desc = eid + ' ' + tag;
        if (tag === 'a') {
          const href = child.getAttribute('href') || '';
          desc += ' "' + label(child) + '" -> ' + href.slice(0, 120);
        } else if (tag === 'input' || tag === 'textarea') {
          desc += ' type=' + (child.type || 'text');
          if (child.name) desc += ' name=' + child.name;
          if (child.placeholder) desc += ' placeholder="' + child.placeholder.slice(0, 40) + '"';
          if (child.required) desc += ' required';
          if (child.type === 'checkbox') desc += child.checked ? ' checked' : ' unchecked';
        } else if (tag === 'select') {
          desc += ' [' + [...child.options].map(o => o.text.trim().slice(0, 24)).join('|') + ']';
        } else {
          desc += ' "' + label(child) + '"';
        }
        if (DOC_HINT.test(desc)) desc += '  <doc?>';
        if (!seen.has(desc)) { seen.add(desc); lines.push(desc); }
      } else if (child.children.length === 0) {
        const text = (child.textContent || '').trim();
        if (text.length > 2 && text.length < 200 && !seen.has(text)) {
          seen.add(text);
          lines.push('  "' + text.slice(0, 100) + '"');
        }
      }
      walk(child, depth + 1);
    }
  }

  if (document.body) walk(document.body, 0);
  return lines.join('\n');
})()
"#;

/// Capture a simplified DOM snapshot from the current page.
pub fn capture_dom_snapshot(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate(SNAPSHOT_JS, false)?;
    let raw = result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default();
    Ok(truncate_snapshot(raw))
}

fn truncate_snapshot(raw: String) -> String {
    if raw.len() <= DOM_SNAPSHOT_MAX_CHARS {
        return raw;
    }
    let mut cut = DOM_SNAPSHOT_MAX_CHARS;
    while !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n... [truncated, {} total chars]", &raw[..cut], raw.len())
}

/// Get the current page title.
pub fn get_page_title(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate("document.title", false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "untitled".to_string()))
}

pub fn user_agent(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate("navigator.userAgent", false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default())
}

/// Fetch `url` with the page's own `fetch`, returning the body bytes.
pub fn fetch_bytes(tab: &Arc<Tab>, url: &str) -> Result<Option<Vec<u8>>> {
    let js = format!(
        r#"(async () => {{
  try {{
    const r = await fetch({url}, {{ credentials: 'include' }});
    if (!r.ok) return null;
    const bytes = new Uint8Array(await r.arrayBuffer());
    let hex = '';
    for (let i = 0; i < bytes.length; i++) hex += bytes[i].toString(16).padStart(2, '0');
    return hex;
  }} catch (e) {{
    return null;
  }}
}})()"#,
        url = serde_json::json!(url)
    );
    let result = tab.evaluate(&js, true)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .and_then(|hex| decode_hex(&hex)))
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Set a `<select>` to the option whose text or value matches `option`.
pub fn select_option_js(selector: &str, option: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return 'missing';
  const want = {opt}.toLowerCase();
  const match = [...el.options].find(o => o.text.trim().toLowerCase() === want || o.value.toLowerCase() === want)
    || [...el.options].find(o => o.text.trim().toLowerCase().includes(want));
  if (!match) return 'no-option';
  el.value = match.value;
  el.dispatchEvent(new Event('input', {{ bubbles: true }}));
  el.dispatchEvent(new Event('change', {{ bubbles: true }}));
  return 'ok';
}})()"#,
        sel = serde_json::json!(selector),
        opt = serde_json::json!(option)
    )
}

/// Clear an input before typing into it.
pub fn clear_value_js(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({}); if (el) el.value = ''; }})()",
        serde_json::json!(selector)
    )
}

/// Map an element descriptor to a CSS selector.
///
/// `[e3]`, `e3` and `3` refer to snapshot ids; anything else is taken as CSS.
pub fn resolve_selector(target: &str) -> String {
    let t = target.trim();
    let inner = t.trim_start_matches('[').trim_end_matches(']');
    let digits = inner.strip_prefix('e').unwrap_or(inner);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        format!("[data-eid=\"[e{digits}]\"]")
    } else {
        t.to_string()
    }
}
