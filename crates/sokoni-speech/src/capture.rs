/// Accumulates a spoken composition from recognition events.
///
/// Finalized segments are append-only; the interim segment is replaced
/// wholesale on every tick and never promoted to a final by this buffer.
/// Only the engine decides when a segment is final.
#[derive(Debug, Default)]
pub struct CaptureBuffer {
    finals: Vec<String>,
    interim: String,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a finalized segment. Empty segments and an exact repeat of the
    /// immediately preceding final are dropped; engines re-deliver the last
    /// final when a session winds down.
    pub fn push_final(&mut self, segment: &str) {
        let segment = segment.trim();
        if segment.is_empty() {
            return;
        }
        if self.finals.last().is_some_and(|last| last == segment) {
            return;
        }
        self.finals.push(segment.to_string());
        self.interim.clear();
    }

    /// Replace the interim segment.
    pub fn set_interim(&mut self, text: &str) {
        self.interim = text.trim().to_string();
    }

    /// The composer text: finalized segments joined by single spaces, with
    /// the current interim trailing.
    pub fn composed(&self) -> String {
        let mut text = self.finals.join(" ");
        if !self.interim.is_empty() {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&self.interim);
        }
        text
    }

    pub fn is_empty(&self) -> bool {
        self.finals.is_empty() && self.interim.is_empty()
    }

    /// Reset for a new recognition session or after a send.
    pub fn clear(&mut self) {
        self.finals.clear();
        self.interim.clear();
    }
}
