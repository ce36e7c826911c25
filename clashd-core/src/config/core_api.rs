//! Discovery of the core's REST controller address and secret
//!
//! Only two top-level scalar keys are needed, so the YAML is scanned line by
//! line instead of being parsed as a document.

use std::fs;
use std::io;
use std::path::Path;

pub const DEFAULT_CONTROLLER: &str = "127.0.0.1:9090";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreApi {
    pub url: String,
    pub secret: String,
}

pub fn discover<P: AsRef<Path>>(core_config: P) -> io::Result<CoreApi> {
    let text = fs::read_to_string(core_config)?;
    Ok(discover_from_str(&text))
}

pub fn discover_from_str(text: &str) -> CoreApi {
    let controller = top_level_value(text, "external-controller")
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_CONTROLLER.to_string());
    let secret = top_level_value(text, "secret").unwrap_or_default();

    CoreApi {
        url: controller_url(&controller),
        secret,
    }
}

fn controller_url(controller: &str) -> String {
    if controller.starts_with("http://") || controller.starts_with("https://") {
        return controller.to_string();
    }
    // ":9090" listens on every address; talk to it over loopback
    if controller.starts_with(':') {
        return format!("http://127.0.0.1{}", controller);
    }
    format!("http://{}", controller)
}

/// Scalar value of an unindented `key: value` line
fn top_level_value(text: &str, key: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        Some(unquote(strip_comment(rest).trim()))
    })
}

fn strip_comment(value: &str) -> &str {
    let trimmed = value.trim_start();
    if trimmed.starts_with('"') || trimmed.starts_with('\'') {
        return value;
    }
    match value.find(" #") {
        Some(idx) => &value[..idx],
        None => value,
    }
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}
