//! End-of-turn deduplication.
//!
//! Transcription engines emit several end-of-turn signals for near-identical
//! utterances (echo, re-segmentation). Only the first one may start a reply.

use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Lowercase and collapse whitespace.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug)]
pub struct TurnDeduplicator {
    cooldown: Duration,
    min_chars: usize,
    seen: HashSet<String>,
    last_finalize: Option<Instant>,
}

impl Default for TurnDeduplicator {
    fn default() -> Self {
        Self::new(Duration::from_millis(1500), 3)
    }
}

impl TurnDeduplicator {
    /// `min_chars`: turns whose trimmed text has this many characters or fewer are rejected.
    pub fn new(cooldown: Duration, min_chars: usize) -> Self {
        Self {
            cooldown,
            min_chars,
            seen: HashSet::new(),
            last_finalize: None,
        }
    }

    /// Decide whether a turn event should start a reply, recording it if so.
    pub fn should_process(&mut self, text: &str, end_of_turn: bool, now: Instant) -> bool {
        if !end_of_turn {
            return false;
        }
        let trimmed = text.trim();
        if trimmed.chars().count() <= self.min_chars {
            return false;
        }
        let normalized = normalize(trimmed);
        if self.seen.contains(&normalized) {
            return false;
        }
        if let Some(last) = self.last_finalize {
            if now.saturating_duration_since(last) < self.cooldown {
                return false;
            }
        }

        self.seen.insert(normalized);
        self.last_finalize = Some(now);
        true
    }

    /// Number of distinct turns accepted so far.
    pub fn accepted(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Book   a\tFlight \n"), "book a flight");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_rejects_partial_turns() {
        let mut dedup = TurnDeduplicator::default();
        assert!(!dedup.should_process("book a flight", false, Instant::now()));
        assert_eq!(dedup.accepted(), 0);
    }

    #[test]
    fn test_rejects_short_text() {
        let mut dedup = TurnDeduplicator::default();
        let now = Instant::now();
        for text in ["", "   ", "ok", "yes", "  hey  "] {
            assert!(!dedup.should_process(text, true, now), "{text:?}");
            assert!(!dedup.should_process(text, false, now), "{text:?}");
        }
        assert!(dedup.should_process("yes!", true, now));
    }

    #[test]
    fn test_duplicate_within_cooldown_rejected() {
        let mut dedup = TurnDeduplicator::default();
        let t0 = Instant::now();
        assert!(dedup.should_process("book a flight", true, t0));
        assert!(!dedup.should_process("Book a  flight", true, t0 + ms(500)));
    }

    #[test]
    fn test_duplicate_after_cooldown_still_rejected() {
        let mut dedup = TurnDeduplicator::default();
        let t0 = Instant::now();
        assert!(dedup.should_process("book a flight", true, t0));
        assert!(!dedup.should_process("BOOK A FLIGHT", true, t0 + ms(10_000)));
    }

    #[test]
    fn test_novel_text_within_cooldown_rejected() {
        let mut dedup = TurnDeduplicator::default();
        let t0 = Instant::now();
        assert!(dedup.should_process("book a flight", true, t0));
        assert!(!dedup.should_process("cancel my hotel", true, t0 + ms(1499)));
        // The rejected turn was not recorded, so it can be accepted later
        assert!(dedup.should_process("cancel my hotel", true, t0 + ms(1500)));
        assert_eq!(dedup.accepted(), 2);
    }

    #[test]
    fn test_custom_thresholds() {
        let mut dedup = TurnDeduplicator::new(ms(0), 5);
        let t0 = Instant::now();
        assert!(!dedup.should_process("hello", true, t0));
        assert!(dedup.should_process("hello!", true, t0));
        assert!(dedup.should_process("second turn", true, t0));
    }
}
