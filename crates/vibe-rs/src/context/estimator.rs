//! Token cost estimation.
//!
//! Eviction decisions must be reproducible, so estimators are pure functions
//! of the text: same input, same cost, and longer text never costs less.
//! The default estimator rounds up and counts bytes rather than characters,
//! which keeps it on the high side for non-ASCII text.

use crate::Message;

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Fixed structural overhead charged per message (role markers, separators).
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Maps text to an approximate token count.
pub trait TokenEstimator: Send + Sync {
    /// Estimated tokens for a piece of text.
    fn estimate(&self, text: &str) -> usize;

    /// Estimated tokens for a whole message: role, content and a fixed
    /// per-message overhead.
    fn message_cost(&self, message: &Message) -> usize {
        self.estimate(message.role().as_str())
            + self.estimate(message.content())
            + MESSAGE_OVERHEAD_TOKENS
    }
}

/// Character-ratio estimator: `ceil(bytes / chars_per_token)`.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: f64,
}

impl CharRatioEstimator {
    /// Create an estimator with a calibrated ratio from historical usage.
    /// Pass `None` (or a non-positive / non-finite ratio) to use the default.
    pub fn with_calibration(calibrated_cpt: Option<f64>) -> Self {
        let cpt = calibrated_cpt
            .filter(|c| c.is_finite() && *c > 0.0)
            .unwrap_or(DEFAULT_CHARS_PER_TOKEN);
        Self {
            chars_per_token: cpt,
        }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::with_calibration(None)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        (text.len() as f64 / self.chars_per_token).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_costs_nothing() {
        assert_eq!(CharRatioEstimator::default().estimate(""), 0);
    }

    #[test]
    fn rounds_up() {
        let est = CharRatioEstimator::default();
        // 1 byte / 3.5 → 0.29, rounded up to a whole token.
        assert_eq!(est.estimate("a"), 1);
        assert_eq!(est.estimate("abcdefg"), 2);
        assert_eq!(est.estimate("abcdefgh"), 3);
    }

    #[test]
    fn monotonic_in_length() {
        let est = CharRatioEstimator::default();
        let mut last = 0;
        for n in 0..200 {
            let cost = est.estimate(&"x".repeat(n));
            assert!(cost >= last, "cost dropped at length {n}");
            last = cost;
        }
    }

    #[test]
    fn deterministic() {
        let est = CharRatioEstimator::default();
        let text = "The quick brown fox jumps over the lazy dog.";
        assert_eq!(est.estimate(text), est.estimate(text));
    }

    #[test]
    fn multibyte_text_biases_high() {
        let est = CharRatioEstimator::default();
        // Seven Hangul syllables are 21 bytes.
        assert_eq!(est.estimate("안녕하세요반가"), 6);
    }

    #[test]
    fn message_cost_includes_role_and_overhead() {
        let est = CharRatioEstimator::default();
        let msg = Message::user("hello world!!");
        // "user" → 2, 13 bytes → 4, overhead 4.
        assert_eq!(est.message_cost(&msg), 2 + 4 + MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn invalid_calibration_falls_back_to_default() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let est = CharRatioEstimator::with_calibration(Some(bad));
            assert_eq!(est.chars_per_token(), DEFAULT_CHARS_PER_TOKEN);
        }
        let calibrated = CharRatioEstimator::with_calibration(Some(4.0));
        assert_eq!(calibrated.estimate(&"a".repeat(40)), 10);
    }
}
