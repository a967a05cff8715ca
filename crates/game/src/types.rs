//! Protocol messages and verifier configuration

use borsh::{BorshDeserialize, BorshSerialize};
use ledger_forest::{Digest, MountainRange};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Messages exchanged between the verifier and a session.
///
/// The verifier relays challenger and responder messages verbatim, so the
/// same enum travels on every channel and every connection.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum Message {
    /// Verifier asking a session for its ledger commitment
    GetMountainRange,

    /// A ledger commitment. Sent by a session in reply to `GetMountainRange`,
    /// and by the verifier to hand a challenger its opponent's range.
    MountainRange(MountainRange),

    /// Challenger reporting that the opponent's peaks are a prefix of its own
    NestedLedger,

    /// Challenger choosing the peak to descend into
    StartRoot { index: u64 },

    /// Responder opening the children of its current node
    NextChildren { hashes: Vec<Digest> },

    /// Challenger choosing the child to descend into
    OpenNext { index: u64 },

    /// Responder revealing the disputed leaf and its predecessor
    StateTransition {
        /// Data of the previous leaf, absent for the first leaf of the ledger
        from: Option<Vec<u8>>,
        /// Inclusion proof of the previous leaf
        from_proof: Vec<Digest>,
        /// Data of the disputed leaf
        to: Vec<u8>,
    },

    /// The sender concedes the current match
    Forfeit { reason: String },
}

impl Message {
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("Message serialization should not fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }

    /// Variant name, for logs and fault reports
    pub fn kind(&self) -> &'static str {
        match self {
            Message::GetMountainRange => "GetMountainRange",
            Message::MountainRange(_) => "MountainRange",
            Message::NestedLedger => "NestedLedger",
            Message::StartRoot { .. } => "StartRoot",
            Message::NextChildren { .. } => "NextChildren",
            Message::OpenNext { .. } => "OpenNext",
            Message::StateTransition { .. } => "StateTransition",
            Message::Forfeit { .. } => "Forfeit",
        }
    }
}

/// Configuration for a verifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Tree dimension every peer is expected to use
    pub dim: usize,
    /// Deadline for each reply. `None` waits indefinitely.
    pub round_timeout: Option<Duration>,
}

impl VerifierConfig {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Default::default()
        }
    }

    pub fn with_round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = Some(timeout);
        self
    }
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            dim: 50,
            round_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format() {
        let msg = Message::StateTransition {
            from: None,
            from_proof: vec![],
            to: b"leaf".to_vec(),
        };
        let bytes = msg.to_bytes();
        // Variant tag first, borsh enum layout
        assert_eq!(bytes[0], 6);
        assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);
        assert!(Message::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(Message::from_bytes(&[42]).is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = VerifierConfig::default();
        assert_eq!(config.dim, 50);
        assert_eq!(config.round_timeout, None);

        let config = VerifierConfig::new(5).with_round_timeout(Duration::from_millis(250));
        assert_eq!(config.dim, 5);
        assert_eq!(config.round_timeout, Some(Duration::from_millis(250)));
    }
}
