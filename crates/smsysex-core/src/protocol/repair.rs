//! Best-effort extraction from malformed device JSON.
//!
//! Firmware builds the reply text by hand and does not escape control
//! bytes inside string values, so a single odd byte in a filename breaks
//! strict JSON parsing. Rather than failing the whole listing, decoding
//! falls back to the fixed extraction grammar below.
//!
//! The grammar is deliberately narrow - only the two reply shapes observed
//! to be affected are recovered:
//!
//! - `^dir`: every `"name": "...", "size": N, "attr": N[, "date": N,
//!   "time": N]` run becomes one entry, with control characters stripped
//!   from the name; a trailing `"err": N` is kept when present.
//! - `^session`: the `sid`, `midMin` and `midMax` integers.
//!
//! Any other malformed body is not guessed at and surfaces as a parse
//! error.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};

fn dir_entry_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?s)"name"\s*:\s*"(.*?)"\s*,\s*"size"\s*:\s*(\d+)\s*,\s*"attr"\s*:\s*(\d+)(?:\s*,\s*"date"\s*:\s*(\d+)\s*,\s*"time"\s*:\s*(\d+))?"#,
        )
        .expect("dir entry regex")
    })
}

fn err_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""err"\s*:\s*(\d+)"#).expect("err regex"))
}

fn session_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#""sid"\s*:\s*(\d+).*?"midMin"\s*:\s*(\d+).*?"midMax"\s*:\s*(\d+)"#,
        )
        .expect("session regex")
    })
}

/// Attempt to recover a reply value from malformed JSON text.
///
/// Returns `None` when the text matches neither recoverable shape.
#[must_use]
pub fn repair(text: &str) -> Option<Value> {
    if text.contains("\"^dir\"") {
        return Some(repair_dir(text));
    }
    if text.contains("\"^session\"") {
        return repair_session(text);
    }
    None
}

/// Recover a directory listing, dropping unparseable bytes from names.
fn repair_dir(text: &str) -> Value {
    let entries: Vec<Value> = dir_entry_re()
        .captures_iter(text)
        .filter_map(|caps| {
            let name: String = caps[1].chars().filter(|c| !c.is_control()).collect();
            let size: u64 = caps[2].parse().ok()?;
            let attr: u8 = caps[3].parse().ok()?;
            let date: u16 = caps.get(4).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            let time: u16 = caps.get(5).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            Some(json!({
                "name": name,
                "size": size,
                "attr": attr,
                "date": date,
                "time": time,
            }))
        })
        .collect();

    // the status is always the last err in the text; earlier ones would
    // belong to entry objects, which do not carry one
    let err = err_re()
        .captures_iter(text)
        .last()
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .unwrap_or(0);

    tracing::warn!(
        entries = entries.len(),
        "recovered directory listing from malformed reply"
    );
    json!({"^dir": {"list": entries, "err": err}})
}

/// Recover a session reply; all three fields are required.
fn repair_session(text: &str) -> Option<Value> {
    let caps = session_re().captures(text)?;
    let sid: u32 = caps[1].parse().ok()?;
    let mid_min: u8 = caps[2].parse().ok()?;
    let mid_max: u8 = caps[3].parse().ok()?;
    tracing::warn!(sid, "recovered session reply from malformed text");
    Some(json!({"^session": {"sid": sid, "midMin": mid_min, "midMax": mid_max}}))
}
