//! Per-speaker transcript accumulation.

/// Who is speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Speaker {
    User,
    Model,
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Model => "model",
        })
    }
}

/// Running transcript of the current turn for both speakers.
#[derive(Debug, Default)]
pub struct TranscriptBuffer {
    user: String,
    model: String,
}

impl TranscriptBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, speaker: Speaker) -> &mut String {
        match speaker {
            Speaker::User => &mut self.user,
            Speaker::Model => &mut self.model,
        }
    }

    /// Append a delta and return the accumulated text for that speaker.
    pub fn append(&mut self, speaker: Speaker, delta: &str) -> &str {
        let slot = self.slot(speaker);
        slot.push_str(delta);
        slot
    }

    /// Accumulated text for `speaker`.
    pub fn get(&self, speaker: Speaker) -> &str {
        match speaker {
            Speaker::User => &self.user,
            Speaker::Model => &self.model,
        }
    }

    /// Take both transcripts (user first), skipping blank ones, and reset.
    pub fn flush(&mut self) -> Vec<(Speaker, String)> {
        [Speaker::User, Speaker::Model]
            .into_iter()
            .filter_map(|speaker| {
                let text = std::mem::take(self.slot(speaker));
                let text = text.trim();
                (!text.is_empty()).then(|| (speaker, text.to_owned()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_accumulates_per_speaker() {
        let mut t = TranscriptBuffer::new();
        assert_eq!(t.append(Speaker::User, "Hel"), "Hel");
        assert_eq!(t.append(Speaker::Model, "Hi"), "Hi");
        assert_eq!(t.append(Speaker::User, "lo"), "Hello");
        assert_eq!(t.get(Speaker::Model), "Hi");
    }

    #[test]
    fn flush_returns_both_and_resets() {
        let mut t = TranscriptBuffer::new();
        t.append(Speaker::Model, " Sure thing. ");
        t.append(Speaker::User, "play jazz");
        assert_eq!(
            t.flush(),
            vec![
                (Speaker::User, "play jazz".to_owned()),
                (Speaker::Model, "Sure thing.".to_owned()),
            ]
        );
        assert_eq!(t.get(Speaker::User), "");
        assert!(t.flush().is_empty());
    }

    #[test]
    fn flush_skips_blank_speaker() {
        let mut t = TranscriptBuffer::new();
        t.append(Speaker::User, "   ");
        t.append(Speaker::Model, "ok");
        assert_eq!(t.flush(), vec![(Speaker::Model, "ok".to_owned())]);
    }
}
