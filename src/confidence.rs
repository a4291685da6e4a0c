//! Confidence scoring for extracted text.
//!
//! The engine compares iterations by this score, so the formula is part of
//! the pipeline's observable behavior and must stay reproducible: 40%
//! alphanumeric density, 40% word-shaped tokens, up to 0.2 for document
//! markers, all damped by a length factor.

use regex::Regex;

use crate::prelude::*;

/// Default document markers, matched case-insensitively as substrings.
const DEFAULT_MARKERS: &[&str] = &[
    "date", "fecha", "total", "invoice", "factura", "name", "nombre", "id", "dni",
    "tax", "iva",
];

/// Scores a text string in [0, 1] from linguistic features.
#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    markers: Vec<String>,
    word_pattern: Regex,
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self::new(DEFAULT_MARKERS.iter().map(|m| (*m).to_owned()).collect())
    }
}

impl ConfidenceScorer {
    /// Create a scorer with a custom marker set.
    pub fn new(markers: Vec<String>) -> Self {
        Self {
            markers,
            word_pattern: Regex::new(r"\b[A-Za-zÀ-ÿ]{2,}\b")
                .expect("word pattern is a valid regex"),
        }
    }

    /// Score `text` in [0, 1], rounded to two decimals. Empty (or
    /// whitespace-only) text scores exactly 0.0.
    pub fn calculate(&self, text: &str) -> f64 {
        if text.trim().is_empty() {
            return 0.0;
        }

        let char_count = text.chars().count();
        let alnum_count = text.chars().filter(|c| c.is_alphanumeric()).count();
        let density = alnum_count as f64 / char_count as f64;

        let word_count = self.word_pattern.find_iter(text).count();
        let word_factor = (word_count as f64 / 10.0).min(1.0);

        let lowered = text.to_lowercase();
        let marker_hits = self.markers.iter().filter(|m| lowered.contains(m.as_str())).count();
        let marker_score = (0.05 * marker_hits as f64).min(0.2);

        let length_factor = (char_count as f64 / 100.0).min(1.0);

        let base_score = 0.4 * density + 0.4 * word_factor + marker_score;
        round2(base_score * length_factor)
    }
}

/// Round to two decimal places.
fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_scores_zero() {
        let scorer = ConfidenceScorer::default();
        assert_eq!(scorer.calculate(""), 0.0);
        assert_eq!(scorer.calculate("   \n\t"), 0.0);
    }

    #[test]
    fn test_short_clean_word() {
        let scorer = ConfidenceScorer::default();
        // density 1.0, one word, no markers, length factor 0.05.
        assert_eq!(scorer.calculate("hello"), 0.02);
    }

    #[test]
    fn test_score_is_bounded() {
        let scorer = ConfidenceScorer::default();
        let samples = [
            "",
            "a",
            "!!!???...",
            "Invoice Total: 1,234.56 EUR - Fecha 2024-03-01, DNI 12345678Z",
            &"word ".repeat(200),
            "ñandú émigré àcôté ÿ",
        ];
        for s in samples {
            let score = scorer.calculate(s);
            assert!((0.0..=1.0).contains(&score), "score {score} for {s:?}");
        }
    }

    #[test]
    fn test_markers_are_monotone() {
        let scorer = ConfidenceScorer::default();
        let base = "Some receipt body with enough words to matter for scoring here";
        let mut text = base.to_owned();
        let mut prev = scorer.calculate(&text);
        for marker in ["invoice", "total", "fecha", "tax"] {
            text = format!("{text} {marker}");
            let next = scorer.calculate(&text);
            assert!(next >= prev, "adding {marker:?} lowered {prev} -> {next}");
            prev = next;
        }
    }

    #[test]
    fn test_marker_score_caps_at_four_markers() {
        let scorer = ConfidenceScorer::default();
        let padding = "lorem ipsum dolor sit amet consectetur adipiscing elit sed do \
                       eiusmod tempor incididunt ut labore";
        let four = scorer.calculate(&format!("{padding} date total invoice name"));
        let six = scorer.calculate(&format!("{padding} date total invoice name tax iva"));
        // Both texts are past the length-factor knee and the marker term is
        // capped at 0.2, so extra markers cannot raise the marker component.
        assert!(six <= four + 0.05);
    }

    #[test]
    fn test_accented_words_count() {
        let scorer = ConfidenceScorer::default();
        let plain = scorer.calculate("zz zz zz zz");
        let accented = scorer.calculate("ñú ñú ñú ñú");
        assert_eq!(plain, accented);
    }
}
