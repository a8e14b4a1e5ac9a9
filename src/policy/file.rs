use std::path::Path;

use sha2::{Digest, Sha256};

use usb_warden_core::rule::Rule;
use usb_warden_core::Result;

/// Ordered rules plus the count of non-empty, non-comment lines seen while
/// parsing. The snapshot is lossless only when every such line parsed; a
/// lossy snapshot must not be used for destructive edits.
#[derive(Debug, Clone)]
pub struct PolicyFileSnapshot {
    pub rules: Vec<Rule>,
    pub line_count: usize,
    pub sha256: String,
}

impl PolicyFileSnapshot {
    pub fn is_lossless(&self) -> bool {
        self.rules.len() == self.line_count
    }
}

pub fn content_sha256(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Parses a rule file line by line. Rule numbers are positional, 1-based
/// over the non-empty, non-comment lines, and recomputed on every read.
/// Never fails outright; losses show up as a count mismatch. A missing file
/// parses as an empty snapshot.
pub fn parse_rule_file(path: &Path) -> Result<PolicyFileSnapshot> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err.into()),
    };
    Ok(parse_rules(&content))
}

pub fn parse_rules(content: &str) -> PolicyFileSnapshot {
    let mut rules = Vec::new();
    let mut line_count = 0usize;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        line_count += 1;
        match Rule::parse(line) {
            Ok(mut rule) => {
                rule.number = Some(line_count);
                rules.push(rule);
            }
            Err(err) => {
                tracing::warn!(line_count, %err, "unparseable rule line");
            }
        }
    }
    PolicyFileSnapshot {
        rules,
        line_count,
        sha256: content_sha256(content),
    }
}

/// Serializes a rule set into rule-file content, one rule per line, hashes
/// included, numbers omitted.
pub fn render_rules(rules: &[Rule]) -> String {
    let mut out = String::new();
    for rule in rules {
        out.push_str(&rule.build_string(false, true));
        out.push('\n');
    }
    out
}
