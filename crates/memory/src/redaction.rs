//! Secret redaction applied to every memory before it is persisted.
//!
//! Three layers run over a segmented view of each field, in order:
//!
//! 1. explicit `<redacted>…</redacted>` tags,
//! 2. credential patterns (key prefixes, assignments, bearer tokens, entropy),
//! 3. project ignore rules from `.memoryignore`.
//!
//! Masked spans become [`PLACEHOLDER`] and are never rescanned by later layers.
//! The layers are iterated to a fixpoint, which makes redaction idempotent.
//! Any internal fault masks the whole field.

use std::{
    collections::HashSet,
    ops::Range,
    panic::{AssertUnwindSafe, catch_unwind},
    path::{Path, PathBuf},
    sync::OnceLock,
};

use {
    echovault_config::Sensitivity,
    globset::{GlobBuilder, GlobMatcher},
    regex::{Regex, RegexBuilder},
    tracing::{debug, warn},
};

use crate::model::TextFields;

/// Replacement text for every masked span.
pub const PLACEHOLDER: &str = "[REDACTED]";

/// Name of the project ignore file.
pub const IGNORE_FILE: &str = ".memoryignore";

const MAX_PASSES: usize = 4;

/// Result of redacting a value: the sanitized copy and how many spans were masked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redacted<T> {
    pub value: T,
    pub masked: usize,
}

#[derive(Debug, Clone)]
enum Segment {
    Plain(String),
    Masked,
}

struct SecretPattern {
    name: &'static str,
    regex: Regex,
}

struct PatternTable {
    low: Vec<SecretPattern>,
    standard: Vec<SecretPattern>,
    /// Set when a built-in pattern failed to compile; every field is then masked.
    degraded: bool,
}

fn pattern_table() -> &'static PatternTable {
    static TABLE: OnceLock<PatternTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut degraded = false;
        let mut compile = |specs: &[(&'static str, &str)]| -> Vec<SecretPattern> {
            specs
                .iter()
                .filter_map(|&(name, pattern)| match Regex::new(pattern) {
                    Ok(regex) => Some(SecretPattern { name, regex }),
                    Err(e) => {
                        warn!(pattern = name, error = %e, "built-in redaction pattern failed to compile");
                        degraded = true;
                        None
                    },
                })
                .collect()
        };
        let low = compile(LOW_PATTERNS);
        let standard = compile(STANDARD_PATTERNS);
        PatternTable {
            low,
            standard,
            degraded,
        }
    })
}

/// Always-on patterns: unambiguous key formats.
const LOW_PATTERNS: &[(&str, &str)] = &[
    (
        "private_key",
        r"-----BEGIN [A-Z0-9 ]*PRIVATE KEY-----(?s:.*?)(?:-----END [A-Z0-9 ]*PRIVATE KEY-----|\z)",
    ),
    ("openai_key", r"\bsk-[A-Za-z0-9_-]{8,}"),
    ("stripe_key", r"\b[spr]k_(?:live|test)_[A-Za-z0-9]{8,}"),
    ("github_token", r"\bgh[pousr]_[A-Za-z0-9]{20,}"),
    ("github_pat", r"\bgithub_pat_[A-Za-z0-9_]{20,}"),
    ("slack_token", r"\bxox[abposr]-[A-Za-z0-9-]{10,}"),
    ("aws_access_key", r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b"),
    ("google_api_key", r"\bAIza[0-9A-Za-z_-]{35}"),
    ("gitlab_token", r"\bglpat-[A-Za-z0-9_-]{20,}"),
    ("npm_token", r"\bnpm_[A-Za-z0-9]{36}"),
];

/// Context-dependent patterns enabled from `standard` upwards. A `secret`
/// group, when present, limits masking to the value.
const STANDARD_PATTERNS: &[(&str, &str)] = &[
    (
        "jwt",
        r"\beyJ[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}",
    ),
    (
        "bearer",
        r"(?i)\bbearer\s+(?P<secret>[A-Za-z0-9._~+/=-]{8,})",
    ),
    (
        "url_credentials",
        r"(?i)\b[a-z][a-z0-9+.-]*://[^\s:/@]+:(?P<secret>[^\s@/]+)@",
    ),
    (
        "assignment",
        r#"(?i)\b[a-z0-9_.-]*(?:api[_-]?key|secret|token|passw(?:or)?d|pwd|private[_-]?key|access[_-]?key)[a-z0-9_.-]*["']?\s*[:=]\s*["']?(?P<secret>[^\s"',;]{3,})"#,
    ),
];

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&regex::escape(PLACEHOLDER)).unwrap_or_else(|_| never_matches()))
}

fn entropy_candidates() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9+_=-]+").unwrap_or_else(|_| never_matches()))
}

fn never_matches() -> Regex {
    // An empty character class cannot match, and always compiles.
    Regex::new(r"[^\s\S]").unwrap_or_else(|_| unreachable!("constant regex"))
}

/// Minimum length and Shannon entropy (bits per char) for opaque-token masking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntropyRule {
    pub min_len: usize,
    pub threshold: f64,
}

fn entropy_rule(sensitivity: Sensitivity) -> Option<EntropyRule> {
    match sensitivity {
        Sensitivity::Low => None,
        Sensitivity::Standard => Some(EntropyRule {
            min_len: 24,
            threshold: 4.2,
        }),
        Sensitivity::Strict => Some(EntropyRule {
            min_len: 16,
            threshold: 3.5,
        }),
    }
}

/// Shannon entropy of `s` in bits per character.
pub fn shannon_entropy(s: &str) -> f64 {
    let mut counts = std::collections::HashMap::new();
    let mut total = 0usize;
    for c in s.chars() {
        *counts.entry(c).or_insert(0usize) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / total as f64;
            -p * p.log2()
        })
        .sum()
}

/// Rules loaded from `.memoryignore` files.
///
/// One rule per line, `#` starts a comment:
/// - `regex:<pattern>` or a bare line: regex masked wherever it matches,
/// - `glob:<pattern>`: whole lines matching the glob are masked,
/// - `field:<name>`: the named field is masked entirely.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    regexes: Vec<Regex>,
    globs: Vec<GlobMatcher>,
    fields: HashSet<String>,
    /// An ignore file existed but could not be read; everything is masked.
    unreadable: bool,
}

impl IgnoreRules {
    pub fn parse(content: &str) -> Self {
        let mut rules = Self::default();
        for raw in content.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(field) = line.strip_prefix("field:") {
                rules.fields.insert(field.trim().to_ascii_lowercase());
            } else if let Some(glob) = line.strip_prefix("glob:") {
                rules.push_glob(glob.trim());
            } else {
                let pattern = line.strip_prefix("regex:").unwrap_or(line).trim();
                rules.push_regex(pattern);
            }
        }
        rules
    }

    /// Load and merge every existing ignore file.
    pub fn load(paths: &[PathBuf]) -> Self {
        let mut merged = Self::default();
        for path in paths {
            match std::fs::read_to_string(path) {
                Ok(content) => merged.merge(Self::parse(&content)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable ignore file, masking all fields");
                    merged.unreadable = true;
                },
            }
        }
        merged
    }

    pub fn merge(&mut self, other: Self) {
        self.regexes.extend(other.regexes);
        self.globs.extend(other.globs);
        self.fields.extend(other.fields);
        self.unreadable |= other.unreadable;
    }

    fn push_regex(&mut self, pattern: &str) {
        let compiled = RegexBuilder::new(pattern)
            .size_limit(1 << 20)
            .build()
            .or_else(|e| {
                // Invalid rules still mask their literal text.
                warn!(rule = pattern, error = %e, "invalid ignore regex, matching literally");
                Regex::new(&regex::escape(pattern))
            });
        if let Ok(regex) = compiled {
            self.regexes.push(regex);
        }
    }

    fn push_glob(&mut self, pattern: &str) {
        match GlobBuilder::new(pattern).literal_separator(false).build() {
            Ok(glob) => self.globs.push(glob.compile_matcher()),
            Err(e) => {
                warn!(rule = pattern, error = %e, "invalid ignore glob, matching literally");
                self.push_regex(&regex::escape(pattern));
            },
        }
    }

    fn masks_field(&self, field: &str) -> bool {
        self.unreadable || self.fields.contains(field)
    }
}

/// The redaction pipeline. Cheap to share; holds no mutable state.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    sensitivity: Sensitivity,
    rules: IgnoreRules,
}

impl Redactor {
    pub fn new(sensitivity: Sensitivity) -> Self {
        Self {
            sensitivity,
            rules: IgnoreRules::default(),
        }
    }

    pub fn with_rules(mut self, rules: IgnoreRules) -> Self {
        self.rules = rules;
        self
    }

    /// Build a redactor from the configured sensitivity and ignore files.
    pub fn load(sensitivity: Sensitivity, ignore_files: &[PathBuf]) -> Self {
        Self::new(sensitivity).with_rules(IgnoreRules::load(ignore_files))
    }

    /// Redact every text field of `item`.
    pub fn redact<T: TextFields + Clone>(&self, item: &T) -> Redacted<T> {
        let mut value = item.clone();
        let mut masked = 0;
        value.visit_text_mut(&mut |field, text| {
            let r = self.redact_field(field, text);
            masked += r.masked;
            *text = r.value;
        });
        Redacted { value, masked }
    }

    /// Redact one field. Never fails: faults mask the whole field.
    pub fn redact_field(&self, field: &str, text: &str) -> Redacted<String> {
        if text.is_empty() {
            return Redacted {
                value: String::new(),
                masked: 0,
            };
        }
        if self.rules.masks_field(field) || pattern_table().degraded {
            return mask_all(text);
        }

        match catch_unwind(AssertUnwindSafe(|| self.converge(text))) {
            Ok(Some(redacted)) => redacted,
            Ok(None) => {
                warn!(field, "redaction did not converge, masking field");
                mask_all(text)
            },
            Err(_) => {
                warn!(field, "redaction fault, masking field");
                mask_all(text)
            },
        }
    }

    /// Redact free text outside of a memory record.
    pub fn redact_text(&self, text: &str) -> String {
        self.redact_field("text", text).value
    }

    fn converge(&self, text: &str) -> Option<Redacted<String>> {
        let mut current = text.to_string();
        let mut masked = 0;
        for _ in 0..MAX_PASSES {
            let (next, n) = self.pass(&current);
            if next == current {
                return Some(Redacted {
                    value: current,
                    masked,
                });
            }
            masked += n;
            current = next;
        }
        None
    }

    fn pass(&self, text: &str) -> (String, usize) {
        let mut segments = mask_explicit_tags(text);
        let tagged = segments
            .iter()
            .filter(|s| matches!(s, Segment::Masked))
            .count();
        segments = split_plain(segments, |s| {
            placeholder_regex().find_iter(s).map(|m| m.range()).collect()
        })
        .0;

        let (segments, pattern_hits) = split_plain(segments, |s| self.pattern_ranges(s));
        let (segments, rule_hits) = split_plain(segments, |s| self.rule_ranges(s));
        if pattern_hits + rule_hits > 0 {
            debug!(pattern_hits, rule_hits, "masked secrets");
        }
        (render(&segments), tagged + pattern_hits + rule_hits)
    }

    fn pattern_ranges(&self, text: &str) -> Vec<Range<usize>> {
        let table = pattern_table();
        let mut ranges = Vec::new();
        let mut scan = |patterns: &[SecretPattern]| {
            for pattern in patterns {
                for caps in pattern.regex.captures_iter(text) {
                    if let Some(m) = caps.name("secret").or_else(|| caps.get(0)) {
                        debug!(pattern = pattern.name, "secret pattern matched");
                        ranges.push(m.range());
                    }
                }
            }
        };
        scan(&table.low);
        if self.sensitivity != Sensitivity::Low {
            scan(&table.standard);
        }
        if let Some(rule) = entropy_rule(self.sensitivity) {
            for m in entropy_candidates().find_iter(text) {
                let token = m.as_str();
                if token.len() >= rule.min_len
                    && token.chars().any(|c| c.is_ascii_digit())
                    && token.chars().any(|c| c.is_ascii_alphabetic())
                    && shannon_entropy(token) >= rule.threshold
                {
                    ranges.push(m.range());
                }
            }
        }
        ranges
    }

    fn rule_ranges(&self, text: &str) -> Vec<Range<usize>> {
        let mut ranges: Vec<Range<usize>> = self
            .rules
            .regexes
            .iter()
            .flat_map(|re| re.find_iter(text).map(|m| m.range()))
            .filter(|r| !r.is_empty())
            .collect();
        if !self.rules.globs.is_empty() {
            let mut offset = 0;
            for line in text.split_inclusive('\n') {
                let body = line.trim_end_matches(['\n', '\r']);
                if !body.trim().is_empty()
                    && self
                        .rules
                        .globs
                        .iter()
                        .any(|g| g.is_match(Path::new(body.trim())))
                {
                    ranges.push(offset..offset + body.len());
                }
                offset += line.len();
            }
        }
        ranges
    }
}

fn mask_all(text: &str) -> Redacted<String> {
    Redacted {
        value: PLACEHOLDER.to_string(),
        masked: usize::from(text != PLACEHOLDER),
    }
}

/// Layer one: `<redacted>…</redacted>`, case-insensitive. An unclosed tag masks to the end.
fn mask_explicit_tags(text: &str) -> Vec<Segment> {
    const OPEN: &str = "<redacted>";
    const CLOSE: &str = "</redacted>";

    let lower = text.to_ascii_lowercase();
    let mut segments = Vec::new();
    let mut cursor = 0;
    while let Some(rel) = lower[cursor..].find(OPEN) {
        let start = cursor + rel;
        if start > cursor {
            segments.push(Segment::Plain(text[cursor..start].to_string()));
        }
        segments.push(Segment::Masked);
        match lower[start + OPEN.len()..].find(CLOSE) {
            Some(end_rel) => cursor = start + OPEN.len() + end_rel + CLOSE.len(),
            None => {
                cursor = text.len();
                break;
            },
        }
    }
    if cursor < text.len() {
        segments.push(Segment::Plain(text[cursor..].to_string()));
    }
    segments
}

/// Apply `find` to every plain segment and split out the ranges it returns.
fn split_plain(
    segments: Vec<Segment>,
    find: impl Fn(&str) -> Vec<Range<usize>>,
) -> (Vec<Segment>, usize) {
    let mut out = Vec::with_capacity(segments.len());
    let mut hits = 0;
    for segment in segments {
        let Segment::Plain(text) = segment else {
            out.push(Segment::Masked);
            continue;
        };
        let ranges = merge_ranges(find(&text));
        if ranges.is_empty() {
            out.push(Segment::Plain(text));
            continue;
        }
        hits += ranges.len();
        let mut cursor = 0;
        for range in ranges {
            if range.start > cursor {
                out.push(Segment::Plain(text[cursor..range.start].to_string()));
            }
            out.push(Segment::Masked);
            cursor = range.end;
        }
        if cursor < text.len() {
            out.push(Segment::Plain(text[cursor..].to_string()));
        }
    }
    (out, hits)
}

fn merge_ranges(mut ranges: Vec<Range<usize>>) -> Vec<Range<usize>> {
    ranges.retain(|r| !r.is_empty());
    ranges.sort_by_key(|r| (r.start, r.end));
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

fn render(segments: &[Segment]) -> String {
    let mut out = String::new();
    let mut previous_masked = false;
    for segment in segments {
        match segment {
            Segment::Plain(text) => {
                out.push_str(text);
                previous_masked = false;
            },
            Segment::Masked => {
                if !previous_masked {
                    out.push_str(PLACEHOLDER);
                }
                previous_masked = true;
            },
        }
    }
    out
}
