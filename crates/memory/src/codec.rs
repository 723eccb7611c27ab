//! Strict markdown codec for session files.
//!
//! ```text
//! # <project> session <YYYY-MM-DD>
//!
//! <!-- echovault:memory <id> -->
//! ### <title>
//!
//! ```yaml
//! id: ...
//! ```
//! <!-- echovault:section what -->
//! #### What
//! <content>
//! <!-- echovault:end -->
//! ```
//!
//! Content lines beginning with the marker prefix are escaped with a leading
//! backslash (and lines already made of backslashes plus the prefix gain one
//! more), so every field decodes byte-for-byte.

use {
    chrono::{DateTime, NaiveDate, Utc},
    serde::{Deserialize, Serialize},
};

use crate::model::{Category, MemoryRecord};

const MARKER_PREFIX: &str = "<!-- echovault:";
const MEMORY_MARKER: &str = "<!-- echovault:memory ";
const SECTION_MARKER: &str = "<!-- echovault:section ";
const END_MARKER: &str = "<!-- echovault:end -->";
const MARKER_SUFFIX: &str = " -->";
const META_OPEN: &str = "```yaml";
const META_CLOSE: &str = "```";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },
    #[error("line {line}: invalid metadata: {source}")]
    Metadata {
        line: usize,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to encode metadata: {0}")]
    Encode(#[source] serde_yaml::Error),
}

fn malformed(line: usize, message: impl Into<String>) -> CodecError {
    CodecError::Malformed {
        line,
        message: message.into(),
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecordMeta {
    id: String,
    title: String,
    category: Category,
    #[serde(default)]
    tags: Vec<String>,
    project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    #[serde(default)]
    related_files: Vec<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    What,
    Why,
    Impact,
    Details,
}

impl Section {
    const ALL: [Section; 4] = [Self::What, Self::Why, Self::Impact, Self::Details];

    fn key(self) -> &'static str {
        match self {
            Self::What => "what",
            Self::Why => "why",
            Self::Impact => "impact",
            Self::Details => "details",
        }
    }

    fn heading(self) -> &'static str {
        match self {
            Self::What => "#### What",
            Self::Why => "#### Why",
            Self::Impact => "#### Impact",
            Self::Details => "#### Details",
        }
    }

    fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.key() == key)
    }
}

/// First line of every session file.
pub fn session_header(project: &str, date: NaiveDate) -> String {
    format!("# {project} session {}\n\n", date.format("%Y-%m-%d"))
}

/// Serialize one record, including its trailing blank line.
pub fn encode_record(record: &MemoryRecord) -> Result<String, CodecError> {
    let meta = RecordMeta {
        id: record.id.clone(),
        title: record.title.clone(),
        category: record.category,
        tags: record.tags.clone(),
        project: record.project.clone(),
        source: record.source.clone(),
        related_files: record.related_files.clone(),
        created_at: record.created_at,
    };
    let yaml = serde_yaml::to_string(&meta).map_err(CodecError::Encode)?;

    let mut out = String::new();
    out.push_str(&format!("{MEMORY_MARKER}{}{MARKER_SUFFIX}\n", record.id));
    out.push_str(&format!("### {}\n\n", record.title));
    out.push_str(META_OPEN);
    out.push('\n');
    out.push_str(yaml.trim_end_matches('\n'));
    out.push('\n');
    out.push_str(META_CLOSE);
    out.push('\n');

    let sections = [
        (Section::What, Some(record.what.as_str())),
        (Section::Why, record.why.as_deref()),
        (Section::Impact, record.impact.as_deref()),
        (Section::Details, record.details.as_deref()),
    ];
    for (section, content) in sections {
        let Some(content) = content else {
            continue;
        };
        out.push_str(&format!("{SECTION_MARKER}{}{MARKER_SUFFIX}\n", section.key()));
        out.push_str(section.heading());
        out.push('\n');
        for line in content.split('\n') {
            out.push_str(&escape_line(line));
            out.push('\n');
        }
    }
    out.push_str(END_MARKER);
    out.push_str("\n\n");
    Ok(out)
}

/// Serialize a whole session file.
pub fn encode_session(
    project: &str,
    date: NaiveDate,
    records: &[MemoryRecord],
) -> Result<String, CodecError> {
    let mut out = session_header(project, date);
    for record in records {
        out.push_str(&encode_record(record)?);
    }
    Ok(out)
}

/// Text before the first record (the header), kept verbatim on rewrites.
pub fn preamble(text: &str) -> &str {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.starts_with(MEMORY_MARKER) {
            return &text[..offset];
        }
        offset += line.len();
    }
    text
}

/// Whether a record marker for `id` is present, without a full decode.
pub fn contains_id(text: &str, id: &str) -> bool {
    let marker = format!("{MEMORY_MARKER}{id}{MARKER_SUFFIX}");
    text.split('\n')
        .any(|line| line.trim_end_matches('\r') == marker)
}

/// Parse every record of a session file, in file order.
pub fn decode_session(text: &str) -> Result<Vec<MemoryRecord>, CodecError> {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut records = Vec::new();
    let mut i = 0;
    let mut seen_record = false;

    while i < lines.len() {
        let line = lines[i];
        if let Some(rest) = line.strip_prefix(MEMORY_MARKER) {
            let id = rest
                .trim_end_matches('\r')
                .strip_suffix(MARKER_SUFFIX)
                .ok_or_else(|| malformed(i + 1, "unterminated memory marker"))?;
            let (record, next) = decode_record(&lines, i, id)?;
            records.push(record);
            seen_record = true;
            i = next;
        } else if seen_record && !line.trim().is_empty() {
            return Err(malformed(i + 1, "unexpected text between records"));
        } else {
            i += 1;
        }
    }
    Ok(records)
}

fn decode_record(
    lines: &[&str],
    start: usize,
    marker_id: &str,
) -> Result<(MemoryRecord, usize), CodecError> {
    let line_at = |idx: usize| -> Result<&str, CodecError> {
        lines
            .get(idx)
            .copied()
            .ok_or_else(|| malformed(idx + 1, "unexpected end of file"))
    };

    let mut i = start + 1;
    if !line_at(i)?.starts_with("### ") {
        return Err(malformed(i + 1, "expected title heading"));
    }
    i += 1;
    if !line_at(i)?.is_empty() {
        return Err(malformed(i + 1, "expected blank line after title"));
    }
    i += 1;
    if line_at(i)? != META_OPEN {
        return Err(malformed(i + 1, "expected metadata block"));
    }
    i += 1;
    let meta_start = i;
    while line_at(i)? != META_CLOSE {
        i += 1;
    }
    let meta: RecordMeta = serde_yaml::from_str(&lines[meta_start..i].join("\n"))
        .map_err(|source| CodecError::Metadata {
            line: meta_start + 1,
            source,
        })?;
    if meta.id != marker_id {
        return Err(malformed(
            start + 1,
            format!("marker id {marker_id} does not match metadata id {}", meta.id),
        ));
    }
    i += 1;

    let mut body: [Option<String>; 4] = Default::default();
    loop {
        let line = line_at(i)?;
        if line.trim_end_matches('\r') == END_MARKER {
            i += 1;
            break;
        }
        let key = line
            .strip_prefix(SECTION_MARKER)
            .and_then(|rest| rest.trim_end_matches('\r').strip_suffix(MARKER_SUFFIX))
            .ok_or_else(|| malformed(i + 1, "expected section marker or end marker"))?;
        let section =
            Section::from_key(key).ok_or_else(|| malformed(i + 1, format!("unknown section {key}")))?;
        let slot = &mut body[section as usize];
        if slot.is_some() {
            return Err(malformed(i + 1, format!("duplicate section {key}")));
        }
        i += 1;
        if line_at(i)? != section.heading() {
            return Err(malformed(i + 1, "expected section heading"));
        }
        i += 1;
        let content_start = i;
        while !line_at(i)?.starts_with(MARKER_PREFIX) {
            i += 1;
        }
        let content: Vec<String> = lines[content_start..i]
            .iter()
            .map(|l| unescape_line(l))
            .collect();
        *slot = Some(content.join("\n"));
    }

    let [what, why, impact, details] = body;
    let what = what.ok_or_else(|| malformed(start + 1, "record has no what section"))?;
    let record = MemoryRecord {
        id: meta.id,
        title: meta.title,
        category: meta.category,
        tags: meta.tags,
        what,
        why,
        impact,
        details,
        related_files: meta.related_files,
        source: meta.source,
        project: meta.project,
        created_at: meta.created_at,
    };
    Ok((record, i))
}

fn escape_line(line: &str) -> String {
    if line.trim_start_matches('\\').starts_with(MARKER_PREFIX) {
        format!("\\{line}")
    } else {
        line.to_string()
    }
}

fn unescape_line(line: &str) -> String {
    match line.strip_prefix('\\') {
        Some(rest) if rest.trim_start_matches('\\').starts_with(MARKER_PREFIX) => rest.to_string(),
        _ => line.to_string(),
    }
}
