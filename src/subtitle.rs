use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SubforgeError};

/// Placeholder for cues that have no translated line.
pub const MISSING_TEXT: &str = "[Missing]";

/// Files smaller than this cannot hold a single cue.
const MIN_SRT_BYTES: u64 = 10;

/// Only the head of a file is inspected by the validity check.
const VALIDATION_WINDOW: u64 = 4096;

/// A timed line of text, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl Segment {
    pub fn new<S: Into<String>>(start: f64, end: f64, text: S) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }
}

/// Format seconds as `HH:MM:SS,mmm`.
pub fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1_000;
    let millis = total_ms % 1_000;

    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}

/// Parse `HH:MM:SS,mmm` (or `.` as the millisecond separator) into seconds.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let value = value.trim();
    let mut parts = value.split(':');
    let hours: u64 = parts.next()?.trim().parse().ok()?;
    let minutes: u64 = parts.next()?.trim().parse().ok()?;
    let rest = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let (secs, millis) = match rest.split_once([',', '.']) {
        Some((s, ms)) => (s, ms),
        None => (rest, "0"),
    };
    let secs: u64 = secs.trim().parse().ok()?;
    let millis: u64 = millis.trim().parse().ok()?;

    Some((hours * 3600 + minutes * 60 + secs) as f64 + millis as f64 / 1000.0)
}

/// Render cues in start order, numbered from 1.
pub fn render_srt(segments: &[Segment]) -> String {
    let mut ordered: Vec<&Segment> = segments.iter().collect();
    ordered.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut content = String::new();
    for (index, segment) in ordered.iter().enumerate() {
        // a blank line would end the cue early
        let text = segment
            .text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        content.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            index + 1,
            format_timestamp(segment.start),
            format_timestamp(segment.end),
            text
        ));
    }
    content
}

/// Parse SRT text into segments, skipping malformed cues.
pub fn parse_srt(content: &str) -> Vec<Segment> {
    let content = content.trim_start_matches('\u{feff}').replace("\r\n", "\n");
    let mut segments = Vec::new();

    for chunk in content.split("\n\n") {
        let lines: Vec<&str> = chunk.trim().lines().collect();
        if lines.len() < 3 {
            continue;
        }
        let index = lines[0].trim();
        if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let Some((start, end)) = lines[1].split_once(" --> ") else {
            continue;
        };
        let (Some(start), Some(end)) = (parse_timestamp(start), parse_timestamp(end)) else {
            continue;
        };
        segments.push(Segment::new(start, end, lines[2..].join(" ")));
    }

    segments
}

/// The first non-whitespace character must be a cue index, and a timestamp
/// range must follow somewhere.
pub fn looks_like_srt(head: &str) -> bool {
    let stripped = head.trim_start_matches('\u{feff}').trim();
    match stripped.chars().next() {
        Some(c) if c.is_ascii_digit() => stripped.contains(" --> "),
        _ => false,
    }
}

/// Validity predicate deciding whether a checkpoint counts as done.
/// Never fails; unreadable or tiny files are invalid.
pub async fn validate_srt(path: &Path) -> bool {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() >= MIN_SRT_BYTES => {}
        _ => return false,
    }

    let mut head = Vec::with_capacity(VALIDATION_WINDOW as usize);
    let read = async {
        let file = fs::File::open(path).await?;
        file.take(VALIDATION_WINDOW).read_to_end(&mut head).await
    };
    if let Err(e) = read.await {
        debug!("Could not read {}: {}", path.display(), e);
        return false;
    }

    looks_like_srt(&String::from_utf8_lossy(&head))
}

/// Read a checkpoint, rejecting files that fail the validity predicate.
pub async fn read_srt(path: &Path) -> Result<Vec<Segment>> {
    if !validate_srt(path).await {
        return Err(SubforgeError::Checkpoint(format!(
            "{} is not a valid subtitle file",
            path.display()
        )));
    }
    let bytes = fs::read(path).await?;
    Ok(parse_srt(&String::from_utf8_lossy(&bytes)))
}

/// Sibling temp path, hidden and unique per writer.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

/// Write bytes to a sibling temp file, then rename it over `path`.
pub async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let temp = temp_sibling(path);
    let written = async {
        fs::write(&temp, content).await?;
        fs::rename(&temp, path).await
    };

    if let Err(e) = written.await {
        if let Err(cleanup) = fs::remove_file(&temp).await {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove temp file {}: {}", temp.display(), cleanup);
            }
        }
        return Err(SubforgeError::Io(e));
    }
    Ok(())
}

/// Atomically write segments as an SRT file.
pub async fn write_srt(segments: &[Segment], path: &Path) -> Result<()> {
    write_atomic(path, render_srt(segments).as_bytes()).await
}

/// Pair translations with source timing and write the result atomically.
/// Missing translations become [`MISSING_TEXT`].
pub async fn save_translated_srt(
    segments: &[Segment],
    translations: &[String],
    path: &Path,
) -> Result<()> {
    let translated: Vec<Segment> = segments
        .iter()
        .enumerate()
        .map(|(i, seg)| {
            let text = translations
                .get(i)
                .map(String::as_str)
                .unwrap_or(MISSING_TEXT);
            Segment::new(seg.start, seg.end, text)
        })
        .collect();
    write_srt(&translated, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0.0), "00:00:00,000");
        assert_eq!(format_timestamp(65.123), "00:01:05,123");
        assert_eq!(format_timestamp(3661.5), "01:01:01,500");
        // rounding carries into the seconds field
        assert_eq!(format_timestamp(1.9996), "00:00:02,000");
    }

    #[test]
    fn test_parse_timestamp_separators() {
        let close = |v: Option<f64>, want: f64| (v.unwrap() - want).abs() < 1e-9;
        assert!(close(parse_timestamp("00:01:05,123"), 65.123));
        assert!(close(parse_timestamp("00:01:05.5"), 65.005));
        assert_eq!(parse_timestamp("01:00:00"), Some(3600.0));
        assert_eq!(parse_timestamp("garbage"), None);
    }

    #[test]
    fn test_parse_skips_garbage_chunks() {
        let content = "\u{feff}1\n00:00:01,000 --> 00:00:02,000\nHello\nworld\n\n\
                       x\n00:00:03,000 --> 00:00:04,000\nSkipped\n\n\
                       2\nnot a time\nSkipped too\n\n\
                       3\n00:00:05,000 --> 00:00:06,500\nBye\n";
        let segments = parse_srt(content);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "Hello world");
        assert_eq!(segments[1], Segment::new(5.0, 6.5, "Bye"));
    }

    #[test]
    fn test_render_sorts_by_start() {
        let rendered = render_srt(&[Segment::new(5.0, 6.0, "second"), Segment::new(1.0, 2.0, "first")]);
        assert!(rendered.starts_with("1\n00:00:01,000 --> 00:00:02,000\nfirst\n\n2\n"));
    }

    #[test]
    fn test_render_collapses_blank_lines_inside_a_cue() {
        let rendered = render_srt(&[
            Segment::new(1.0, 2.0, "line one\n\n  \nline two\n"),
            Segment::new(3.0, 4.0, "next"),
        ]);
        assert!(rendered.starts_with("1\n00:00:01,000 --> 00:00:02,000\nline one\nline two\n\n2\n"));

        let segments = parse_srt(&rendered);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "line one line two");
        assert_eq!(segments[1].text, "next");
    }

    #[test]
    fn test_looks_like_srt() {
        assert!(looks_like_srt("\u{feff}  1\n00:00:01,000 --> 00:00:02,000\nHi"));
        assert!(!looks_like_srt("   \n\t  "));
        assert!(!looks_like_srt("WEBVTT\n\n00:01.000 --> 00:02.000"));
        assert!(!looks_like_srt("1\n00:00:0"));
    }

    #[tokio::test]
    async fn test_whitespace_checkpoint_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.en.srt");
        fs::write(&path, "      \n\n\n      ").await.unwrap();
        assert!(!validate_srt(&path).await);
        assert!(read_srt(&path).await.is_err());
        assert!(!validate_srt(&dir.path().join("missing.srt")).await);
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.en.srt");
        let segments = vec![Segment::new(0.5, 1.25, "One"), Segment::new(2.0, 3.0, "Two")];

        write_srt(&segments, &path).await.unwrap();
        assert!(validate_srt(&path).await);
        assert_eq!(read_srt(&path).await.unwrap(), segments);

        // no temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_write_never_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.fr.srt");
        let full = render_srt(&[Segment::new(0.0, 1.0, "Bonjour")]);

        // a crash before the rename leaves only the temp sibling
        let temp = temp_sibling(&path);
        fs::write(&temp, &full.as_bytes()[..full.len() / 2]).await.unwrap();
        assert!(!validate_srt(&path).await);

        // truncated content written in place is rejected as well
        fs::write(&path, &full.as_bytes()[..8]).await.unwrap();
        assert!(!validate_srt(&path).await);
    }

    #[tokio::test]
    async fn test_failed_write_cleans_temp() {
        let dir = tempfile::tempdir().unwrap();
        // target is a directory, so the rename fails
        let path = dir.path().join("occupied");
        std::fs::create_dir_all(path.join("child")).unwrap();

        assert!(write_srt(&[Segment::new(0.0, 1.0, "x")], &path).await.is_err());
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["occupied".to_string()]);
    }

    #[tokio::test]
    async fn test_save_translated_pads_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.es.srt");
        let segments = vec![Segment::new(0.0, 1.0, "a"), Segment::new(1.0, 2.0, "b")];

        save_translated_srt(&segments, &["uno".to_string()], &path).await.unwrap();
        let read = read_srt(&path).await.unwrap();
        assert_eq!(read[0].text, "uno");
        assert_eq!(read[1].text, MISSING_TEXT);
        assert_eq!(read[1].start, 1.0);
    }
}
