//! Transcript view model.

use crate::types::Message;

/// One row of a rendered conversation.
///
/// The in-flight reply is its own variant, so a view never has to infer it
/// from position or a sentinel id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEntry {
    /// A committed turn.
    Committed(Message),
    /// The exchange currently streaming.
    InFlight {
        /// The user turn being answered; not committed yet.
        prompt: String,
        /// Reply text received so far.
        partial: String,
    },
}

impl TranscriptEntry {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::InFlight { .. })
    }
}

/// Build a transcript from committed history and an optional in-flight turn.
pub fn build(committed: &[Message], in_flight: Option<(String, String)>) -> Vec<TranscriptEntry> {
    committed
        .iter()
        .cloned()
        .map(TranscriptEntry::Committed)
        .chain(in_flight.map(|(prompt, partial)| TranscriptEntry::InFlight { prompt, partial }))
        .collect()
}
