//! Per-stream accumulator of partial thinking text.

use std::collections::HashMap;

/// Thinking text accumulated so far, per candidate index.
///
/// Owned by a single transform pipeline and cleared when its stream ends.
#[derive(Debug, Default, Clone)]
pub struct ThoughtBuffer {
    texts: HashMap<usize, String>,
}

impl ThoughtBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulated text for a candidate.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.texts.get(&index).map(String::as_str)
    }

    /// Append `text` to a candidate's accumulated thinking.
    pub fn set(&mut self, index: usize, text: &str) {
        self.texts.entry(index).or_default().push_str(text);
    }

    pub fn clear(&mut self) {
        self.texts.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_appends() {
        let mut buffer = ThoughtBuffer::new();
        assert!(buffer.get(0).is_none());

        buffer.set(0, "A");
        buffer.set(0, "B");
        buffer.set(1, "x");

        assert_eq!(buffer.get(0), Some("AB"));
        assert_eq!(buffer.get(1), Some("x"));
    }

    #[test]
    fn test_clear() {
        let mut buffer = ThoughtBuffer::new();
        buffer.set(2, "thinking");
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.get(2).is_none());
    }
}
