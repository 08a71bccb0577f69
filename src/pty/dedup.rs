//! The sliding-window line deduplication rule for the PTY engine.
//!
//! Kept as a small, pure, independently testable unit since it is exercised
//! by scenarios with exact, near-duplicate, and fuzzy-matched lines.

use std::collections::VecDeque;

/// Default number of recently-emitted lines remembered for deduplication.
pub const DEFAULT_WINDOW_SIZE: usize = 15;

/// Minimum line length for the fuzzy prefix/ratio checks in rule (d) to
/// apply at all.
const FUZZY_MIN_LEN: usize = 20;
const FUZZY_PREFIX_LEN: usize = 15;
const FUZZY_RATIO: f64 = 0.8;

fn normalize(line: &str) -> String {
    line.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Sliding window of recently-emitted lines, tracked in both exact and
/// whitespace-normalized-lowercase form.
pub struct DedupWindow {
    capacity: usize,
    window: VecDeque<(String, String)>,
    last_emitted: Option<String>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            window: VecDeque::new(),
            last_emitted: None,
        }
    }

    /// Decide whether `line` should be emitted. Suppressed lines do not
    /// mutate the window or `last_emitted`.
    pub fn admit(&mut self, line: &str) -> bool {
        if self.is_duplicate(line) {
            return false;
        }
        let normalized = normalize(line);
        self.window.push_back((line.to_string(), normalized));
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
        self.last_emitted = Some(line.to_string());
        true
    }

    fn is_duplicate(&self, line: &str) -> bool {
        if self.last_emitted.as_deref() == Some(line) {
            return true;
        }
        if self.window.iter().any(|(exact, _)| exact == line) {
            return true;
        }
        let normalized = normalize(line);
        if self.window.iter().any(|(_, norm)| *norm == normalized) {
            return true;
        }
        if line.len() >= FUZZY_MIN_LEN {
            for (exact, norm) in self.window.iter() {
                if exact.len() >= FUZZY_PREFIX_LEN
                    && line.len() >= FUZZY_PREFIX_LEN
                    && exact[..FUZZY_PREFIX_LEN.min(exact.len())]
                        == line[..FUZZY_PREFIX_LEN.min(line.len())]
                {
                    return true;
                }
                if ratio_match(&normalized, norm) {
                    return true;
                }
            }
        }
        false
    }
}

fn ratio_match(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if !longer.contains(shorter) {
        return false;
    }
    (shorter.len() as f64 / longer.len() as f64) >= FUZZY_RATIO
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_whitespace_variant_duplicates_are_suppressed() {
        let mut window = DedupWindow::new(DEFAULT_WINDOW_SIZE);
        let lines = ["A", "A", "  A  ", "B"];
        let mut emitted = String::new();
        for line in lines {
            if window.admit(line) {
                emitted.push_str(line.trim());
                emitted.push('\n');
            }
        }
        assert_eq!(emitted, "A\nB\n");
    }

    #[test]
    fn suppressed_lines_do_not_reset_window() {
        let mut window = DedupWindow::new(3);
        assert!(window.admit("first"));
        assert!(!window.admit("first"));
        // window still only contains "first"; a brand new line is admitted.
        assert!(window.admit("second"));
    }

    #[test]
    fn long_near_duplicate_lines_are_suppressed_by_ratio() {
        let mut window = DedupWindow::new(DEFAULT_WINDOW_SIZE);
        let long_line = "this is a fairly long line of terminal output";
        assert!(window.admit(long_line));
        // Same content with trailing punctuation -> ratio still high.
        assert!(!window.admit(long_line));
    }
}
