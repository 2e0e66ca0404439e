//! Timed-caption parsing.
//!
//! Recognizer output arrives in the comma-delimited SRT convention
//! (`HH:MM:SS,mmm --> HH:MM:SS,mmm`). Conversion first normalizes the
//! content for a strict cue parser; if the strict parser rejects it, a
//! relaxed block parser salvages whatever cues are well formed. Either way
//! the caller gets an ordered, renumbered segment list and never an error.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const STRICT_HEADER: &str = "WEBVTT";
const TIMING_SEPARATOR: &str = "-->";

#[derive(Debug, Error)]
pub enum SubtitleError {
    #[error("missing WEBVTT header")]
    MissingHeader,
    #[error("cue {index}: malformed timing line `{line}`")]
    MalformedTiming { index: usize, line: String },
    #[error("invalid timestamp `{0}`")]
    Timestamp(String),
    #[error("cue {index}: start {start} is not before end {end}")]
    CueOrdering { index: usize, start: f64, end: f64 },
    #[error("cue {index} has no text")]
    EmptyText { index: usize },
}

pub type SubtitleResult<T> = std::result::Result<T, SubtitleError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub index: u32,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub text: String,
}

/// Decode `HH:MM:SS[,.]mmm` into floating-point seconds.
pub fn parse_timestamp(raw: &str) -> SubtitleResult<f64> {
    let trimmed = raw.trim();
    let parts: Vec<&str> = trimmed.split(':').collect();
    if parts.len() != 3 {
        return Err(SubtitleError::Timestamp(trimmed.to_string()));
    }
    let hours: f64 = parts[0]
        .parse()
        .map_err(|_| SubtitleError::Timestamp(trimmed.to_string()))?;
    let minutes: f64 = parts[1]
        .parse()
        .map_err(|_| SubtitleError::Timestamp(trimmed.to_string()))?;
    let seconds: f64 = parts[2]
        .replace(',', ".")
        .parse()
        .map_err(|_| SubtitleError::Timestamp(trimmed.to_string()))?;
    Ok(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Convert raw caption content into ordered transcript segments.
///
/// Malformed input can only shrink the output; it never fails the caller.
pub fn convert(content: &str) -> Vec<TranscriptSegment> {
    match parse_strict(&reformat_for_strict(content)) {
        Ok(segments) => segments,
        Err(error) => {
            debug!(%error, "strict caption parse failed, using relaxed parser");
            parse_relaxed(content)
        }
    }
}

/// Rewrite comma sub-second delimiters on timing lines to dots and prepend
/// the header token the strict parser requires.
fn reformat_for_strict(content: &str) -> String {
    let mut out = String::with_capacity(content.len() + STRICT_HEADER.len() + 2);
    out.push_str(STRICT_HEADER);
    out.push_str("\n\n");
    for line in content.lines() {
        if line.contains(TIMING_SEPARATOR) {
            out.push_str(&line.replace(',', "."));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

/// Strict cue parser: rejects the whole document on any malformed cue.
pub fn parse_strict(content: &str) -> SubtitleResult<Vec<TranscriptSegment>> {
    let mut lines = content.lines().peekable();
    match lines.next() {
        Some(first) if first.trim_start_matches('\u{feff}').starts_with(STRICT_HEADER) => {}
        _ => return Err(SubtitleError::MissingHeader),
    }

    let mut segments = Vec::new();
    while let Some(&line) = lines.peek() {
        if line.trim().is_empty() {
            lines.next();
            continue;
        }
        let cue_number = segments.len() + 1;
        let mut timing = lines.next().map(str::trim).unwrap_or_default();
        // optional numeric cue identifier before the timing line
        if !timing.contains(TIMING_SEPARATOR) {
            timing = lines.next().map(str::trim).unwrap_or_default();
        }
        let (start, end) =
            parse_timing_line(timing).ok_or_else(|| SubtitleError::MalformedTiming {
                index: cue_number,
                line: timing.to_string(),
            })?;
        if start >= end {
            return Err(SubtitleError::CueOrdering {
                index: cue_number,
                start,
                end,
            });
        }
        let mut text_lines = Vec::new();
        while let Some(&line) = lines.peek() {
            if line.trim().is_empty() {
                break;
            }
            text_lines.push(line.trim());
            lines.next();
        }
        let text = text_lines.join(" ").trim().to_string();
        if text.is_empty() {
            return Err(SubtitleError::EmptyText { index: cue_number });
        }
        segments.push(TranscriptSegment {
            index: cue_number as u32,
            start_seconds: start,
            end_seconds: end,
            text,
        });
    }
    Ok(segments)
}

/// Relaxed block parser: cue index line, timing line, text lines. Blocks
/// without a valid timing line are dropped rather than failing the batch.
fn parse_relaxed(content: &str) -> Vec<TranscriptSegment> {
    let normalized = content.replace("\r\n", "\n");
    let mut segments = Vec::new();
    for block in normalized.split("\n\n") {
        let lines: Vec<&str> = block
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        if lines.len() < 2 {
            continue;
        }
        let Some((start, end)) = parse_timing_line(lines[1]) else {
            debug!(line = lines[1], "dropping caption block with bad timing");
            continue;
        };
        if start >= end {
            continue;
        }
        let text = lines[2..].join(" ").trim().to_string();
        if text.is_empty() {
            continue;
        }
        segments.push(TranscriptSegment {
            index: segments.len() as u32 + 1,
            start_seconds: start,
            end_seconds: end,
            text,
        });
    }
    segments
}

fn parse_timing_line(line: &str) -> Option<(f64, f64)> {
    let (start_raw, rest) = line.split_once(TIMING_SEPARATOR)?;
    // trailing cue settings after the end timestamp are ignored
    let end_raw = rest.trim().split_whitespace().next()?;
    let start = parse_timestamp(start_raw).ok()?;
    let end = parse_timestamp(end_raw).ok()?;
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_FORMED: &str = "1\n00:00:01,000 --> 00:00:03,500\nWelcome to the course.\n\n2\n00:00:04,000 --> 00:00:06,000\nToday we cover ownership.\n\n3\n00:00:06,500 --> 00:00:09,250\nLet's get started.\n";

    #[test]
    fn parses_comma_delimited_timestamp() {
        assert_eq!(parse_timestamp("00:01:02,500").unwrap(), 62.5);
    }

    #[test]
    fn parses_dot_delimited_timestamp() {
        assert_eq!(parse_timestamp("00:01:05.000").unwrap(), 65.0);
    }

    #[test]
    fn rejects_timestamp_without_three_fields() {
        assert!(parse_timestamp("01:02").is_err());
        assert!(parse_timestamp("garbage").is_err());
    }

    #[test]
    fn converts_well_formed_captions() {
        let segments = convert(WELL_FORMED);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].index, 1);
        assert_eq!(segments[0].start_seconds, 1.0);
        assert_eq!(segments[0].end_seconds, 3.5);
        assert_eq!(segments[2].text, "Let's get started.");
    }

    #[test]
    fn malformed_block_is_dropped_and_rest_renumbered() {
        let content = "1\n00:00:01,000 --> 00:00:02,000\nFirst cue.\n\n2\nnot a timing line\nBroken cue.\n\n3\n00:00:03,000 --> 00:00:04,000\nSecond cue.\n\n4\n00:00:05,000 --> 00:00:06,000\nThird cue.\n";
        let segments = convert(content);
        assert_eq!(segments.len(), 3);
        let indices: Vec<u32> = segments.iter().map(|segment| segment.index).collect();
        assert_eq!(indices, [1, 2, 3]);
        assert_eq!(segments[0].text, "First cue.");
        assert_eq!(segments[1].text, "Second cue.");
        assert_eq!(segments[2].text, "Third cue.");
    }

    #[test]
    fn multi_line_cue_text_is_joined_with_spaces() {
        let content = "1\n00:00:01,000 --> 00:00:02,000\nline one\nline two\n";
        let segments = convert(content);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "line one line two");
    }

    #[test]
    fn inverted_cue_timing_is_dropped() {
        let content = "1\n00:00:05,000 --> 00:00:02,000\nBackwards.\n\n2\n00:00:06,000 --> 00:00:07,000\nForwards.\n";
        let segments = convert(content);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "Forwards.");
        assert_eq!(segments[0].index, 1);
    }

    #[test]
    fn empty_content_yields_no_segments() {
        assert!(convert("").is_empty());
        assert!(convert("\n\n\n").is_empty());
    }

    #[test]
    fn strict_parser_requires_header() {
        assert!(matches!(
            parse_strict(WELL_FORMED),
            Err(SubtitleError::MissingHeader)
        ));
    }
}
