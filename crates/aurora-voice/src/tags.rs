//! Bracketed reply tags: `[URGENCY: critical]`, `[SOURCES: a, b]`.
//!
//! Grammar, applied left to right over the raw model output:
//!
//! ```text
//! tag   := '[' key ':' value ']'
//! key   := "URGENCY" | "SOURCES"        (case-insensitive, surrounding spaces ignored)
//! value := any text without '[' or ']'
//! ```
//!
//! Recognised tags are removed from the reply text. Anything else in brackets, including
//! unterminated or nested brackets, is left in place as ordinary text.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Urgency classification attached to a generated response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    /// Life-threatening, immediate danger
    Critical,
    /// Serious but not immediately life-threatening
    Urgent,
    #[default]
    Normal,
    /// How-to and troubleshooting requests
    Assistive,
}

impl Urgency {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "urgent" => Some(Self::Urgent),
            "normal" => Some(Self::Normal),
            "assistive" => Some(Self::Assistive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Urgent => "urgent",
            Self::Normal => "normal",
            Self::Assistive => "assistive",
        }
    }

    /// Responses at this level are recorded in the session's alert log.
    pub fn is_alert(&self) -> bool {
        matches!(self, Self::Critical | Self::Urgent)
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKey {
    Urgency,
    Sources,
}

impl TagKey {
    fn parse(key: &str) -> Option<Self> {
        match key.trim().to_ascii_uppercase().as_str() {
            "URGENCY" => Some(Self::Urgency),
            "SOURCES" => Some(Self::Sources),
            _ => None,
        }
    }
}

/// Model output with tags extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedReply {
    pub text: String,
    pub urgency: Urgency,
    pub sources: Vec<String>,
}

/// Extract urgency/sources tags and strip them from `raw`.
///
/// The first URGENCY tag decides the level; an unknown value falls back to
/// `Urgency::Normal`. SOURCES tags accumulate.
pub fn parse_reply(raw: &str) -> TaggedReply {
    let mut text = String::with_capacity(raw.len());
    let mut urgency: Option<Urgency> = None;
    let mut sources: Vec<String> = Vec::new();

    let mut rest = raw;
    while let Some(open) = rest.find('[') {
        text.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let close = after.find(']');
        let reopen = after.find('[');
        let close = match (close, reopen) {
            (Some(c), Some(r)) if r < c => {
                // nested or stray '[': keep it literally and rescan from the inner one
                text.push('[');
                text.push_str(&after[..r]);
                rest = &after[r..];
                continue;
            }
            (Some(c), _) => c,
            (None, _) => {
                text.push_str(&rest[open..]);
                rest = "";
                break;
            }
        };

        let inner = &after[..close];
        let tag = inner
            .split_once(':')
            .and_then(|(k, v)| TagKey::parse(k).map(|key| (key, v)));

        match tag {
            Some((TagKey::Urgency, value)) => {
                if urgency.is_none() {
                    urgency = Some(Urgency::parse(value).unwrap_or_else(|| {
                        debug!(value = value.trim(), "unrecognised urgency value, using normal");
                        Urgency::Normal
                    }));
                }
            }
            Some((TagKey::Sources, value)) => {
                sources.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                );
            }
            None => {
                text.push('[');
                text.push_str(inner);
                text.push(']');
            }
        }
        rest = &after[close + 1..];
    }
    text.push_str(rest);

    TaggedReply {
        text: tidy(&text),
        urgency: urgency.unwrap_or_default(),
        sources,
    }
}

/// Collapse the gaps left by removed tags; keep line structure.
fn tidy(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
