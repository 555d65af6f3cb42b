//! Handoff signals exchanged on the coordination channel.
//!
//! Wire format: `"<phrase> <instance id>"`. The phrases are matched
//! byte-for-byte as prefixes, so they must never change.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Sent by a starting instance: older instances should retire.
    Shutdown,
    /// Sent by a retiring instance once its caches are saved.
    DidShutdown,
}

/// Why a coordination-channel message is not a usable signal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("unknown signal phrase")]
    UnknownPhrase,
    #[error("signal carries no valid instance id")]
    MissingInstanceId,
}

impl Signal {
    pub const ALL: [Signal; 2] = [Signal::Shutdown, Signal::DidShutdown];

    pub fn phrase(self) -> &'static str {
        match self {
            Signal::Shutdown => "Hello the other Pennys 👋 you can retire now :)",
            Signal::DidShutdown => "I'm retired!",
        }
    }

    /// Message body announcing this signal from `instance_id`.
    pub fn message(self, instance_id: u64) -> String {
        format!("{} {instance_id}", self.phrase())
    }

    /// Parse a message body into the signal and the sender's instance id.
    ///
    /// The kind is recognized by phrase prefix; the id is the token after
    /// the last run of whitespace.
    pub fn parse(text: &str) -> Result<(Signal, u64), SignalError> {
        let signal = Self::ALL
            .into_iter()
            .find(|s| text.starts_with(s.phrase()))
            .ok_or(SignalError::UnknownPhrase)?;
        let instance_id = text
            .split_whitespace()
            .last()
            .and_then(|token| token.parse().ok())
            .ok_or(SignalError::MissingInstanceId)?;
        Ok((signal, instance_id))
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Shutdown => f.write_str("shutdown"),
            Signal::DidShutdown => f.write_str("did-shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_is_phrase_space_id() {
        assert_eq!(
            Signal::Shutdown.message(1700000000123),
            "Hello the other Pennys 👋 you can retire now :) 1700000000123"
        );
        assert_eq!(Signal::DidShutdown.message(5), "I'm retired! 5");
    }

    #[test]
    fn parse_reads_kind_and_trailing_id() {
        for signal in Signal::ALL {
            assert_eq!(Signal::parse(&signal.message(42)), Ok((signal, 42)));
        }
        assert_eq!(
            Signal::parse("I'm retired!   \t 77 \n"),
            Ok((Signal::DidShutdown, 77))
        );
    }

    #[test]
    fn parse_rejects_unknown_or_malformed() {
        assert_eq!(
            Signal::parse("Hello there 42"),
            Err(SignalError::UnknownPhrase)
        );
        assert_eq!(
            Signal::parse("  I'm retired! 42"),
            Err(SignalError::UnknownPhrase)
        );
        assert_eq!(
            Signal::parse("I'm retired!"),
            Err(SignalError::MissingInstanceId)
        );
        assert_eq!(
            Signal::parse("I'm retired! soon"),
            Err(SignalError::MissingInstanceId)
        );
    }
}
