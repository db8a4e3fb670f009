/// Accumulated model transcript for the current turn.
#[derive(Debug, Default, Clone)]
pub struct TranscriptBuffer {
    text: String,
}

impl TranscriptBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta, space-separated, and return the trimmed result.
    pub fn append(&mut self, delta: &str) -> &str {
        let joined = format!("{} {}", self.text, delta);
        self.text = joined.trim().to_string();
        &self.text
    }

    /// Clear at a turn boundary.
    pub fn clear(&mut self) {
        self.text.clear();
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::TranscriptBuffer;

    #[test]
    fn deltas_join_with_single_space_and_trim() {
        let mut buf = TranscriptBuffer::new();
        assert_eq!(buf.append("Hel"), "Hel");
        assert_eq!(buf.append("lo "), "Hel lo");
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.append("Hi"), "Hi");
    }

    #[test]
    fn whitespace_only_delta_keeps_text() {
        let mut buf = TranscriptBuffer::new();
        buf.append("ok");
        assert_eq!(buf.append("  "), "ok");
    }
}
