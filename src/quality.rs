use tracing::{debug, info, warn};

use crate::config::HallucinationConfig;
use crate::models::TranscribedSegment;
use crate::subtitle::Segment;

/// Language detection below this confidence is worth a warning.
pub const LOW_LANGUAGE_CONFIDENCE: f32 = 0.4;

/// Counts of what the filter removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterReport {
    pub known_phrases: usize,
    pub silent: usize,
    pub repeated: usize,
}

impl FilterReport {
    pub fn total(&self) -> usize {
        self.known_phrases + self.silent + self.repeated
    }
}

/// Removes segments the transcriber tends to invent on silence or noise.
pub struct HallucinationFilter {
    phrases: Vec<String>,
    silence_threshold: f32,
    repetition_threshold: usize,
}

impl HallucinationFilter {
    pub fn new(config: &HallucinationConfig) -> Self {
        Self {
            phrases: config.known_phrases.iter().map(|p| p.to_lowercase()).collect(),
            silence_threshold: config.silence_threshold,
            repetition_threshold: config.repetition_threshold,
        }
    }

    fn normalize(text: &str) -> String {
        text.trim()
            .to_lowercase()
            .trim_matches(|c: char| ".,!?;: ".contains(c))
            .to_string()
    }

    /// A short line that is mostly a known outro/call-to-action phrase.
    pub fn is_known_phrase(&self, text: &str) -> bool {
        let clean = Self::normalize(text);
        let len = clean.chars().count();
        self.phrases
            .iter()
            .any(|phrase| clean.contains(phrase.as_str()) && len < phrase.chars().count() + 5)
    }

    /// Drop hallucinated, silent and runaway-repeated segments, then order
    /// the survivors by start time.
    pub fn apply(&self, segments: Vec<TranscribedSegment>) -> (Vec<Segment>, FilterReport) {
        let mut report = FilterReport::default();
        let mut kept: Vec<Segment> = Vec::with_capacity(segments.len());
        let mut run_text = String::new();
        let mut run_len = 0usize;

        for segment in segments {
            let text = segment.text.trim().to_string();
            if text.is_empty() {
                continue;
            }
            if self.is_known_phrase(&text) {
                debug!("Dropping known hallucination: {}", text);
                report.known_phrases += 1;
                continue;
            }
            if segment.no_speech_prob > self.silence_threshold {
                report.silent += 1;
                continue;
            }

            let normalized = Self::normalize(&text);
            if normalized == run_text {
                run_len += 1;
            } else {
                run_text = normalized;
                run_len = 1;
            }
            if self.repetition_threshold > 0 && run_len >= self.repetition_threshold {
                report.repeated += 1;
                continue;
            }

            kept.push(Segment::new(segment.start, segment.end, text));
        }

        kept.sort_by(|a, b| a.start.total_cmp(&b.start));
        if report.total() > 0 {
            info!(
                "Filtered {} segments ({} known phrases, {} silent, {} repeated)",
                report.total(),
                report.known_phrases,
                report.silent,
                report.repeated
            );
        }
        (kept, report)
    }
}

pub fn warn_on_low_confidence(language: &str, probability: f32) {
    if probability > 0.0 && probability < LOW_LANGUAGE_CONFIDENCE {
        warn!(
            "Low confidence ({:.0}%) in detected language '{}'; consider forcing the source language",
            probability * 100.0,
            language
        );
    }
}
