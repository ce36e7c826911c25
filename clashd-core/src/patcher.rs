//! Line-based patching of the core's `tun:` section
//!
//! The core config is user-edited YAML, so it is never re-serialized: only
//! the `enable:` and `device:` lines of the top-level `tun:` block are
//! touched and every other line is kept byte for byte.

use tracing::warn;

const DEFAULT_CHILD_INDENT: &str = "  ";

/// Turn TUN on and point it at `device`
pub fn enable_tun(text: &str, device: &str) -> String {
    let mut doc = Document::parse(text);

    let Some(block) = doc.find_tun_block() else {
        if doc.has_inline_tun() {
            warn!("Top-level tun: is not a block mapping, leaving core config unchanged");
            return text.to_string();
        }
        doc.append_block(device);
        return doc.render();
    };

    let indent = block.indent.clone();
    let enable_at = match doc.find_key(&block, "enable") {
        Some(idx) => {
            doc.set_value(idx, &indent, "enable", "true");
            idx
        }
        None => {
            doc.lines
                .insert(block.header + 1, format!("{}enable: true", indent));
            block.header + 1
        }
    };

    // indices after the insertion point may have shifted, search again
    let block = match doc.find_tun_block() {
        Some(block) => block,
        None => return doc.render(),
    };
    match doc.find_key(&block, "device") {
        Some(idx) => doc.set_value(idx, &indent, "device", device),
        None => doc
            .lines
            .insert(enable_at + 1, format!("{}device: {}", indent, device)),
    }

    doc.render()
}

/// Turn TUN off, leaving every other field alone
pub fn disable_tun(text: &str) -> String {
    let mut doc = Document::parse(text);
    let Some(block) = doc.find_tun_block() else {
        return text.to_string();
    };
    match doc.find_key(&block, "enable") {
        Some(idx) => {
            let indent = block.indent.clone();
            doc.set_value(idx, &indent, "enable", "false");
            doc.render()
        }
        None => text.to_string(),
    }
}

struct Document {
    lines: Vec<String>,
    eol: &'static str,
    trailing_newline: bool,
}

struct TunBlock {
    header: usize,
    /// one past the last line of the block
    end: usize,
    indent: String,
}

impl Document {
    fn parse(text: &str) -> Self {
        let eol = if text.contains("\r\n") { "\r\n" } else { "\n" };
        let trailing_newline = text.ends_with('\n');
        let body = text.strip_suffix(eol).unwrap_or(text);
        let lines = if text.is_empty() {
            Vec::new()
        } else {
            body.split(eol).map(str::to_string).collect()
        };
        Self {
            lines,
            eol,
            trailing_newline,
        }
    }

    fn render(&self) -> String {
        let mut out = self.lines.join(self.eol);
        if self.trailing_newline && !self.lines.is_empty() {
            out.push_str(self.eol);
        }
        out
    }

    fn find_tun_block(&self) -> Option<TunBlock> {
        let header = self.lines.iter().position(|l| is_tun_header(l))?;

        let mut end = self.lines.len();
        for (idx, line) in self.lines.iter().enumerate().skip(header + 1) {
            if is_blank_or_comment(line) {
                continue;
            }
            if !line.starts_with([' ', '\t']) {
                end = idx;
                break;
            }
        }

        let indent = self.lines[header + 1..end]
            .iter()
            .find(|l| !is_blank_or_comment(l))
            .map(|l| leading_whitespace(l).to_string())
            .unwrap_or_else(|| DEFAULT_CHILD_INDENT.to_string());

        Some(TunBlock {
            header,
            end,
            indent,
        })
    }

    fn has_inline_tun(&self) -> bool {
        self.lines
            .iter()
            .any(|l| l.starts_with("tun:") && !is_tun_header(l))
    }

    fn find_key(&self, block: &TunBlock, key: &str) -> Option<usize> {
        (block.header + 1..block.end).find(|&idx| {
            self.lines[idx]
                .strip_prefix(block.indent.as_str())
                .and_then(|rest| rest.strip_prefix(key))
                .is_some_and(|rest| rest.starts_with(':'))
        })
    }

    /// Replace the scalar after `key:` keeping any trailing comment
    fn set_value(&mut self, idx: usize, indent: &str, key: &str, value: &str) {
        let line = &self.lines[idx];
        let head_len = indent.len() + key.len() + 1;
        let rest = &line[head_len..];
        let current = value_part(rest);
        if current == value {
            return;
        }

        let suffix = match rest.find(" #") {
            Some(i) => &rest[rest[..i].trim_end().len()..],
            None => "",
        };
        let patched = format!("{} {}{}", &line[..head_len], value, suffix);
        self.lines[idx] = patched;
    }

    fn append_block(&mut self, device: &str) {
        self.trailing_newline = true;
        self.lines.push("tun:".to_string());
        self.lines
            .push(format!("{}enable: true", DEFAULT_CHILD_INDENT));
        self.lines
            .push(format!("{}device: {}", DEFAULT_CHILD_INDENT, device));
    }
}

fn is_tun_header(line: &str) -> bool {
    match line.strip_prefix("tun:") {
        Some(rest) => {
            let rest = rest.trim();
            rest.is_empty() || rest.starts_with('#')
        }
        None => false,
    }
}

fn is_blank_or_comment(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

fn leading_whitespace(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

fn value_part(rest: &str) -> &str {
    let without_comment = match rest.find(" #") {
        Some(i) => &rest[..i],
        None => rest,
    };
    without_comment.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_then_disable() {
        let original = "mixed-port: 7890\ntun:\n  enable: false\n  stack: system\ndns:\n  enable: true\n";

        let enabled = enable_tun(original, "Meta");
        assert_eq!(
            enabled,
            "mixed-port: 7890\ntun:\n  enable: true\n  device: Meta\n  stack: system\ndns:\n  enable: true\n"
        );

        let disabled = disable_tun(&enabled);
        assert_eq!(
            disabled,
            "mixed-port: 7890\ntun:\n  enable: false\n  device: Meta\n  stack: system\ndns:\n  enable: true\n"
        );
    }

    #[test]
    fn test_minimal_block() {
        assert_eq!(
            enable_tun("tun:\n  enable: false\n", "Meta"),
            "tun:\n  enable: true\n  device: Meta\n"
        );
    }

    #[test]
    fn test_replaces_device_and_keeps_comments() {
        let original = "tun: # tun settings\n    enable: false   # off for now\n    device: utun0 # old\n    auto-route: false\n";
        let enabled = enable_tun(original, "Meta");
        assert_eq!(
            enabled,
            "tun: # tun settings\n    enable: true   # off for now\n    device: Meta # old\n    auto-route: false\n"
        );
    }

    #[test]
    fn test_already_enabled_is_unchanged() {
        let original = "tun:\n  enable: true\n  device: Meta\n";
        assert_eq!(enable_tun(original, "Meta"), original);
    }

    #[test]
    fn test_nested_keys_are_not_touched() {
        let original = "tun:\n  enable: false\n  dns-hijack:\n    enable: false\nprofile:\n  enable: false\n";
        let enabled = enable_tun(original, "Meta");
        assert_eq!(
            enabled,
            "tun:\n  enable: true\n  device: Meta\n  dns-hijack:\n    enable: false\nprofile:\n  enable: false\n"
        );
    }

    #[test]
    fn test_missing_enable_is_inserted() {
        assert_eq!(
            enable_tun("tun:\n  stack: mixed\nport: 1\n", "Meta"),
            "tun:\n  enable: true\n  device: Meta\n  stack: mixed\nport: 1\n"
        );
    }

    #[test]
    fn test_missing_block_is_appended() {
        assert_eq!(
            enable_tun("port: 7890", "Meta"),
            "port: 7890\ntun:\n  enable: true\n  device: Meta\n"
        );
        assert_eq!(disable_tun("port: 7890\n"), "port: 7890\n");
    }

    #[test]
    fn test_indented_tun_is_not_top_level() {
        let original = "listeners:\n  tun:\n    enable: false\n";
        assert_eq!(disable_tun(original), original);
    }

    #[test]
    fn test_inline_mapping_left_alone() {
        let original = "tun: {enable: false}\n";
        assert_eq!(enable_tun(original, "Meta"), original);
    }

    #[test]
    fn test_crlf_preserved() {
        let original = "a: 1\r\ntun:\r\n  enable: false\r\n";
        assert_eq!(
            enable_tun(original, "Meta"),
            "a: 1\r\ntun:\r\n  enable: true\r\n  device: Meta\r\n"
        );
    }
}
