//! Control-command classification.
//!
//! Control ports carry free text. Classification is by case-insensitive
//! substring, checked in a fixed priority order; the first keyword found
//! wins. Nodes only ever see the parsed [`ControlCommand`].

use tracing::debug;

/// A classified control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Begin the conversation.
    Start,
    /// End the conversation.
    Stop,
    /// Ask a participant to take its turn.
    Speak,
    /// Clear per-speaker state.
    Reset,
}

impl ControlCommand {
    /// Keywords in priority order.
    const KEYWORDS: [(&'static str, Self); 4] = [
        ("start", Self::Start),
        ("stop", Self::Stop),
        ("speak", Self::Speak),
        ("reset", Self::Reset),
    ];

    /// Classify a raw control string. Returns `None` for unrecognised text.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let lower = raw.to_lowercase();
        let mut matches = Self::KEYWORDS
            .iter()
            .filter(|(keyword, _)| lower.contains(keyword))
            .map(|(_, command)| *command);
        let first = matches.next()?;
        if matches.next().is_some() {
            debug!(raw, chosen = ?first, "control string matches several commands");
        }
        Some(first)
    }

    /// Whether a participant should begin speaking on this command.
    #[must_use]
    pub fn begins_turn(self) -> bool {
        matches!(self, Self::Start | Self::Speak)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Speak => "speak",
            Self::Reset => "reset",
        }
    }
}
