//! Sentence units for streamed synthesis.
//!
//! A reply is split on terminal punctuation, each piece is cleaned up for the speech
//! engine, and the survivors are numbered in order. The number travels with the unit
//! through synthesis and playback.

use tracing::debug;

/// One sentence of a reply. `seq` starts at 0 and has no gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseUnit {
    pub seq: usize,
    pub text: String,
}

fn is_terminal(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

fn is_closing(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | '”' | '’')
}

/// Split on `.`, `!` or `?` (and runs of them) followed by whitespace or end of text.
/// Numbered-list markers such as `2.` stay attached to the sentence they introduce.
pub fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        current.push(c);
        i += 1;
        if !is_terminal(c) {
            continue;
        }
        while i < chars.len() && (is_terminal(chars[i]) || is_closing(chars[i])) {
            current.push(chars[i]);
            i += 1;
        }
        let at_boundary = i >= chars.len() || chars[i].is_whitespace();
        if !at_boundary {
            continue;
        }
        let trimmed = current.trim();
        let list_marker = trimmed
            .trim_end_matches(is_terminal)
            .chars()
            .all(|c| c.is_ascii_digit());
        if list_marker && i < chars.len() {
            continue;
        }
        if !trimmed.is_empty() {
            sentences.push(trimmed.to_string());
        }
        current.clear();
    }

    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

fn is_allowed(c: char) -> bool {
    c.is_alphanumeric()
        || c.is_whitespace()
        || matches!(
            c,
            '.' | ',' | '!' | '?' | ';' | ':' | '\'' | '"' | '-' | '(' | ')' | '%' | '/' | '&' | '$'
                | '+' | '°'
        )
}

/// Clean one unit for synthesis. Returns `None` when nothing speakable remains.
///
/// Strips markdown and symbols the voice would read out or choke on, collapses whitespace
/// and repeated punctuation, ensures terminal punctuation and caps the length at
/// `max_chars` on a word boundary.
pub fn sanitize_unit(text: &str, max_chars: usize) -> Option<String> {
    let mut cleaned = String::with_capacity(text.len());
    let mut last: Option<char> = None;
    for c in text.chars() {
        let c = if c.is_whitespace() || c.is_control() {
            ' '
        } else if is_allowed(c) {
            c
        } else {
            continue;
        };
        match (last, c) {
            (Some(' '), ' ') => continue,
            (Some(prev), c) if is_terminal(prev) && is_terminal(c) => continue,
            (Some(prev), c) if prev == c && matches!(c, ',' | ';' | ':' | '-') => continue,
            _ => {}
        }
        cleaned.push(c);
        last = Some(c);
    }

    let cleaned = cleaned
        .trim()
        .trim_start_matches(|c: char| matches!(c, ',' | ';' | ':' | '-' | '.' | '!' | '?') || c == ' ');
    if !cleaned.chars().any(char::is_alphanumeric) {
        return None;
    }

    let mut unit = cleaned.trim_end().to_string();
    if !unit.ends_with(|c: char| is_terminal(c) || is_closing(c)) {
        unit = unit
            .trim_end_matches(|c: char| matches!(c, ',' | ';' | ':' | '-'))
            .trim_end()
            .to_string();
        unit.push('.');
    }

    let max_chars = max_chars.max(2);
    if unit.chars().count() > max_chars {
        let head: String = unit.chars().take(max_chars - 1).collect();
        let cut = match head.rfind(' ') {
            Some(pos) if pos > 0 => &head[..pos],
            _ => head.as_str(),
        };
        let cut = cut.trim_end_matches(|c: char| !c.is_alphanumeric());
        if cut.is_empty() {
            return None;
        }
        debug!(original = unit.chars().count(), max_chars, "unit truncated");
        unit = format!("{}.", cut);
    }

    Some(unit)
}

/// Split and sanitize a reply into numbered units, skipping degenerate ones.
pub fn prepare_units(text: &str, max_chars: usize) -> Vec<ResponseUnit> {
    split_sentences(text)
        .iter()
        .filter_map(|s| {
            let unit = sanitize_unit(s, max_chars);
            if unit.is_none() {
                debug!(sentence = %s, "skipping unspeakable unit");
            }
            unit
        })
        .enumerate()
        .map(|(seq, text)| ResponseUnit { seq, text })
        .collect()
}
