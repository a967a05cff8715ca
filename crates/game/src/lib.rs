//! Bisection Game - Super-light client verification over untrusted peers
//!
//! Architecture:
//! - Every peer serves its ledger through a Session that plays either side
//!   of the bisection game
//! - The Verifier referees two-party matches by relaying and checking moves
//! - A tournament over all peers finds the longest ledger consistent with
//!   every other surviving ledger
//! - Sessions reach the verifier over in-process channels or WebSocket links

pub mod types;
pub mod session;
pub mod transition;
pub mod verifier;
pub mod wire;

pub use types::*;
pub use session::{Session, SessionError, SessionHandle, SessionState};
pub use transition::{AcceptAll, TransitionValidator};
pub use verifier::{
    Fault, MatchOutcome, MatchReport, TournamentResult, Verifier, VerifierError,
};
pub use wire::{LedgerServer, PeerLink};

/// Capacity of every session and link channel
pub const CHANNEL_CAPACITY: usize = 100;

#[cfg(test)]
mod tests;
