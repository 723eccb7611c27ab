//! Memory records and the raw input they are built from.

use std::{collections::HashSet, fmt, str::FromStr};

use {
    chrono::{DateTime, NaiveDate, Utc},
    serde::{Deserialize, Serialize},
};

use crate::error::{MemoryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Decision,
    Bug,
    Pattern,
    Setup,
    Learning,
    Context,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Self::Decision,
        Self::Bug,
        Self::Pattern,
        Self::Setup,
        Self::Learning,
        Self::Context,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Bug => "bug",
            Self::Pattern => "pattern",
            Self::Setup => "setup",
            Self::Learning => "learning",
            Self::Context => "context",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| {
                MemoryError::Validation(format!(
                    "unknown category {s:?}; expected one of decision, bug, pattern, setup, learning, context"
                ))
            })
    }
}

/// Caller-supplied fields for a new memory, before validation and redaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMemory {
    pub title: String,
    pub what: String,
    #[serde(default)]
    pub why: Option<String>,
    #[serde(default)]
    pub impact: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub related_files: Vec<String>,
    #[serde(default)]
    pub source: Option<String>,
    pub project: String,
}

impl NewMemory {
    /// Check required fields and normalise the rest.
    ///
    /// Empty optional text becomes `None`, tags are deduplicated
    /// case-insensitively, and a missing category defaults to `context`.
    pub fn normalize(self) -> Result<Self> {
        let title = self.title.trim().to_string();
        if title.is_empty() {
            return Err(MemoryError::Validation("title is required".into()));
        }
        if title.contains(['\n', '\r']) {
            return Err(MemoryError::Validation(
                "title must be a single line".into(),
            ));
        }
        if self.what.trim().is_empty() {
            return Err(MemoryError::Validation("what is required".into()));
        }
        validate_project(&self.project)?;

        let source = non_empty(self.source).map(|s| s.trim().to_string());
        if source.as_deref().is_some_and(|s| s.contains(['\n', '\r'])) {
            return Err(MemoryError::Validation(
                "source must be a single line".into(),
            ));
        }

        Ok(Self {
            title,
            what: self.what.trim().to_string(),
            why: non_empty(self.why),
            impact: non_empty(self.impact),
            details: non_empty(self.details),
            tags: normalize_tags(self.tags),
            category: Some(self.category.unwrap_or(Category::Context)),
            related_files: self
                .related_files
                .into_iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty() && !f.contains(['\n', '\r']))
                .collect(),
            source,
            project: self.project,
        })
    }
}

/// A persisted memory. Immutable once written; only deletion removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub title: String,
    pub category: Category,
    pub tags: Vec<String>,
    pub what: String,
    pub why: Option<String>,
    pub impact: Option<String>,
    pub details: Option<String>,
    pub related_files: Vec<String>,
    pub source: Option<String>,
    pub project: String,
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Build the record for a sanitized, normalised input.
    pub fn from_new(input: NewMemory, id: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            title: input.title,
            category: input.category.unwrap_or(Category::Context),
            tags: input.tags,
            what: input.what,
            why: input.why,
            impact: input.impact,
            details: input.details,
            related_files: input.related_files,
            source: input.source,
            project: input.project,
            created_at,
        }
    }

    /// Calendar day (UTC) of the session file holding this record.
    pub fn session_date(&self) -> NaiveDate {
        self.created_at.date_naive()
    }

    /// Text fed to the embedding provider: title, what, why, impact and tags.
    pub fn embedding_text(&self) -> String {
        let mut parts = vec![self.title.as_str(), self.what.as_str()];
        parts.extend(self.why.as_deref());
        parts.extend(self.impact.as_deref());
        let tags = self.tags.join(" ");
        if !tags.is_empty() {
            parts.push(&tags);
        }
        parts.join(" ")
    }

    /// True when the record carries more than its title and summary line.
    pub fn has_extra_fields(&self) -> bool {
        self.why.is_some()
            || self.impact.is_some()
            || self.details.is_some()
            || !self.related_files.is_empty()
    }
}

/// Visit every free-text field of a memory, including list entries.
///
/// Redaction walks fields through this so new fields cannot be forgotten.
pub trait TextFields {
    fn visit_text_mut(&mut self, f: &mut dyn FnMut(&'static str, &mut String));
}

fn visit_common(
    title: &mut String,
    what: &mut String,
    optional: [(&'static str, &mut Option<String>); 4],
    tags: &mut [String],
    related_files: &mut [String],
    f: &mut dyn FnMut(&'static str, &mut String),
) {
    f("title", title);
    f("what", what);
    for (name, value) in optional {
        if let Some(value) = value {
            f(name, value);
        }
    }
    for tag in tags {
        f("tags", tag);
    }
    for file in related_files {
        f("related_files", file);
    }
}

impl TextFields for NewMemory {
    fn visit_text_mut(&mut self, f: &mut dyn FnMut(&'static str, &mut String)) {
        visit_common(
            &mut self.title,
            &mut self.what,
            [
                ("why", &mut self.why),
                ("impact", &mut self.impact),
                ("details", &mut self.details),
                ("source", &mut self.source),
            ],
            &mut self.tags,
            &mut self.related_files,
            f,
        );
    }
}

impl TextFields for MemoryRecord {
    fn visit_text_mut(&mut self, f: &mut dyn FnMut(&'static str, &mut String)) {
        visit_common(
            &mut self.title,
            &mut self.what,
            [
                ("why", &mut self.why),
                ("impact", &mut self.impact),
                ("details", &mut self.details),
                ("source", &mut self.source),
            ],
            &mut self.tags,
            &mut self.related_files,
            f,
        );
    }
}

/// Project identifiers become directory names inside the vault.
pub fn validate_project(project: &str) -> Result<()> {
    let ok = !project.is_empty()
        && project.len() <= 128
        && !project.starts_with('.')
        && project
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(MemoryError::Validation(format!(
            "invalid project {project:?}: use letters, digits, '-', '_' or '.'"
        )))
    }
}

/// Trim, drop empties and deduplicate case-insensitively, keeping the first spelling.
pub fn normalize_tags(tags: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && !t.contains(['\n', '\r']))
        .filter(|t| seen.insert(t.to_lowercase()))
        .collect()
}

/// Split a comma-separated tag or path list.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}
