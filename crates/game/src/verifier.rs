//! Verifier - referees matches and runs the tournament
//!
//! The verifier never trusts a session. It relays every move between the two
//! players of a match, checks each opening against the hash it already holds,
//! and decides the match the moment one side sends something it cannot back
//! up. Protocol violations end in a `MatchReport`, never in an error.

use crate::transition::{AcceptAll, TransitionValidator};
use crate::types::{Message, VerifierConfig};
use ledger_forest::{Blake3Hasher, HashError, MerkleHasher, MountainRange, RangeError};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// How a match ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchOutcome {
    /// One ledger is a peak-level prefix of the other
    BothWin,
    Winner { winner: usize, loser: usize },
}

/// The protocol violation that decided a match
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Fault {
    #[error("expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    #[error("children in round {round} do not hash to the committed node")]
    HashMismatch { round: u32 },

    #[error("opened {actual} children, dimension is {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index {index} out of range (bound {bound})")]
    IndexOutOfRange { index: u64, bound: u64 },

    #[error("revealed leaf does not hash to the committed leaf")]
    LeafMismatch,

    #[error("predecessor proof does not check against its peak")]
    BadPredecessorProof,

    #[error("predecessor revealed for the first leaf")]
    UnexpectedPredecessor,

    #[error("state transition rejected: {0}")]
    TransitionRejected(String),

    #[error("forfeited: {0}")]
    Forfeited(String),

    #[error("channel closed")]
    Disconnected,

    #[error("no reply before the round deadline")]
    Timeout,
}

/// Result of one match
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchReport {
    pub challenger: usize,
    pub responder: usize,
    pub outcome: MatchOutcome,
    /// Absolute index of the leaf the game narrowed down to
    pub disputed_leaf: Option<u64>,
    /// The violation committed by the loser, if any
    pub fault: Option<Fault>,
}

impl MatchReport {
    pub fn winner(&self) -> Option<usize> {
        match self.outcome {
            MatchOutcome::BothWin => None,
            MatchOutcome::Winner { winner, .. } => Some(winner),
        }
    }
}

/// Result of a tournament
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TournamentResult {
    /// Index of the winning peer
    pub winner: usize,
    /// Commitment of the winning peer
    pub mountain_range: MountainRange,
    /// Every match played, in order
    pub matches: Vec<MatchReport>,
}

/// Failures that stop the verifier itself
#[derive(Error, Debug)]
pub enum VerifierError {
    #[error("{to} outbound channels but {from} inbound channels")]
    ChannelCountMismatch { to: usize, from: usize },

    #[error("No peers to verify")]
    NoPeers,

    #[error("Peer index {0} out of range")]
    UnknownPeer(usize),

    #[error("Peer {peer} replied {got} instead of its mountain range")]
    UnexpectedReply { peer: usize, got: &'static str },

    #[error("Peer {peer} reported an invalid mountain range: {reason}")]
    InvalidMountainRange { peer: usize, reason: RangeError },

    #[error("Channel to peer {peer} closed")]
    ChannelClosed { peer: usize },

    #[error("Peer {peer} did not report its mountain range in time")]
    Timeout { peer: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Challenger,
    Responder,
}

enum Verdict {
    BothWin,
    ResponderWins,
}

/// Super-light client verifier over a fixed set of peers
pub struct Verifier {
    to: Vec<mpsc::Sender<Message>>,
    from: Vec<mpsc::Receiver<Message>>,
    config: VerifierConfig,
    hasher: Blake3Hasher,
    validator: Arc<dyn TransitionValidator>,
}

impl Verifier {
    /// Create a verifier over paired channels, one pair per peer
    pub fn new(
        to: Vec<mpsc::Sender<Message>>,
        from: Vec<mpsc::Receiver<Message>>,
        config: VerifierConfig,
    ) -> Result<Self, VerifierError> {
        if to.len() != from.len() {
            return Err(VerifierError::ChannelCountMismatch {
                to: to.len(),
                from: from.len(),
            });
        }
        Ok(Self {
            to,
            from,
            hasher: Blake3Hasher::new(config.dim),
            config,
            validator: Arc::new(AcceptAll),
        })
    }

    /// Replace the default accept-all transition check
    pub fn with_transition_validator<V>(mut self, validator: V) -> Self
    where
        V: TransitionValidator + 'static,
    {
        self.validator = Arc::new(validator);
        self
    }

    pub fn peer_count(&self) -> usize {
        self.to.len()
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Run a tournament and return the peer holding the longest ledger that
    /// survived every match.
    pub async fn run(&mut self) -> Result<TournamentResult, VerifierError> {
        let ranges = self.collect_ranges().await?;
        let totals: Vec<u64> = ranges.iter().map(MountainRange::total).collect();

        let mut safe = BTreeSet::new();
        let mut matches = Vec::new();

        for peer in 0..ranges.len() {
            if safe.is_empty() {
                safe.insert(peer);
                continue;
            }

            loop {
                let (best, best_total) =
                    largest_safe(&safe, &totals).ok_or(VerifierError::NoPeers)?;
                let report = if best_total > totals[peer] {
                    self.run_match(best, peer, &ranges[peer]).await?
                } else {
                    self.run_match(peer, best, &ranges[best]).await?
                };
                let outcome = report.outcome;
                matches.push(report);

                match outcome {
                    MatchOutcome::BothWin => {
                        safe.insert(peer);
                        break;
                    }
                    MatchOutcome::Winner { winner, loser } if winner == peer => {
                        safe.remove(&loser);
                        if safe.is_empty() {
                            safe.insert(peer);
                            break;
                        }
                    }
                    MatchOutcome::Winner { .. } => break,
                }
            }
        }

        let (winner, total) = largest_safe(&safe, &totals).ok_or(VerifierError::NoPeers)?;
        tracing::info!(
            "Tournament over {} peers won by peer {} ({} leaves, {} matches)",
            ranges.len(),
            winner,
            total,
            matches.len()
        );

        Ok(TournamentResult {
            winner,
            mountain_range: ranges[winner].clone(),
            matches,
        })
    }

    /// Play one match. `pmr` is the responder's mountain range; the
    /// responder is expected to hold the shorter or equal ledger.
    pub async fn run_match(
        &mut self,
        challenger: usize,
        responder: usize,
        pmr: &MountainRange,
    ) -> Result<MatchReport, VerifierError> {
        for peer in [challenger, responder] {
            if peer >= self.peer_count() {
                return Err(VerifierError::UnknownPeer(peer));
            }
            self.discard_stale(peer);
        }
        pmr.validate(self.config.dim)
            .map_err(|reason| VerifierError::InvalidMountainRange {
                peer: responder,
                reason,
            })?;

        let mut disputed_leaf = None;
        let result = self
            .play(challenger, responder, pmr, &mut disputed_leaf)
            .await;

        let (outcome, fault) = match result {
            Ok(Verdict::BothWin) => (MatchOutcome::BothWin, None),
            Ok(Verdict::ResponderWins) => (
                MatchOutcome::Winner {
                    winner: responder,
                    loser: challenger,
                },
                None,
            ),
            Err((Side::Challenger, fault)) => (
                MatchOutcome::Winner {
                    winner: responder,
                    loser: challenger,
                },
                Some(fault),
            ),
            Err((Side::Responder, fault)) => (
                MatchOutcome::Winner {
                    winner: challenger,
                    loser: responder,
                },
                Some(fault),
            ),
        };

        match &fault {
            Some(fault) => tracing::warn!(
                "Match {} vs {}: {:?}, fault: {}",
                challenger,
                responder,
                outcome,
                fault
            ),
            None => tracing::info!(
                "Match {} vs {}: {:?}, disputed leaf {:?}",
                challenger,
                responder,
                outcome,
                disputed_leaf
            ),
        }

        Ok(MatchReport {
            challenger,
            responder,
            outcome,
            disputed_leaf,
            fault,
        })
    }

    async fn play(
        &mut self,
        challenger: usize,
        responder: usize,
        pmr: &MountainRange,
        disputed_leaf: &mut Option<u64>,
    ) -> Result<Verdict, (Side, Fault)> {
        use Side::{Challenger, Responder};

        self.send(challenger, Challenger, Message::MountainRange(pmr.clone()))
            .await?;
        let start = match self.recv(challenger, Challenger).await? {
            Message::StartRoot { index } => index,
            Message::NestedLedger => return Ok(Verdict::BothWin),
            other => return Err((Challenger, unexpected("StartRoot", other))),
        };
        let peak = usize::try_from(start)
            .ok()
            .filter(|&i| i < pmr.len())
            .ok_or((
                Challenger,
                Fault::IndexOutOfRange {
                    index: start,
                    bound: pmr.len() as u64,
                },
            ))?;
        self.send(responder, Responder, Message::StartRoot { index: start })
            .await?;

        let dim = self.config.dim as u64;
        let mut ptr = pmr.roots[peak];
        let mut size = pmr.sizes[peak];
        let mut offset = 0u64;
        let mut round = 0u32;

        while size > 1 {
            round += 1;
            let hashes = match self.recv(responder, Responder).await? {
                Message::NextChildren { hashes } => hashes,
                other => return Err((Responder, unexpected("NextChildren", other))),
            };
            match self.hasher.hash_children(&hashes) {
                Ok(parent) if parent == ptr => {}
                Ok(_) => return Err((Responder, Fault::HashMismatch { round })),
                Err(HashError::DimensionMismatch { expected, actual }) => {
                    return Err((Responder, Fault::DimensionMismatch { expected, actual }))
                }
            }
            self.send(challenger, Challenger, Message::NextChildren { hashes: hashes.clone() })
                .await?;

            let index = match self.recv(challenger, Challenger).await? {
                Message::OpenNext { index } => index,
                other => return Err((Challenger, unexpected("OpenNext", other))),
            };
            let child = usize::try_from(index)
                .ok()
                .and_then(|i| hashes.get(i).copied())
                .ok_or((Challenger, Fault::IndexOutOfRange { index, bound: dim }))?;
            self.send(responder, Responder, Message::OpenNext { index }).await?;

            size /= dim;
            ptr = child;
            offset = offset * dim + index;
            tracing::debug!("Round {}: opened child {} of peak {}", round, index, peak);
        }

        // The previous leaf sits just before us in this peak, or closes the previous one
        let prev_leaf = if offset == 0 {
            peak.checked_sub(1).map(|prev| (prev, pmr.sizes[prev] - 1))
        } else {
            Some((peak, offset - 1))
        };
        let leaf = pmr.sizes[..peak].iter().sum::<u64>() + offset;
        *disputed_leaf = Some(leaf);

        let (from, from_proof, to) = match self.recv(responder, Responder).await? {
            Message::StateTransition { from, from_proof, to } => (from, from_proof, to),
            other => return Err((Responder, unexpected("StateTransition", other))),
        };
        if self.hasher.hash_leaf(&to) != ptr {
            return Err((Responder, Fault::LeafMismatch));
        }
        match prev_leaf {
            Some((prev, position)) => {
                let proven = from.as_deref().is_some_and(|from| {
                    self.hasher
                        .check_proof_at(from, &from_proof, position, &pmr.roots[prev])
                });
                if !proven {
                    return Err((Responder, Fault::BadPredecessorProof));
                }
            }
            None => {
                if from.is_some() || !from_proof.is_empty() {
                    return Err((Responder, Fault::UnexpectedPredecessor));
                }
            }
        }
        self.validator
            .validate(from.as_deref(), &to, leaf)
            .map_err(|reason| (Responder, Fault::TransitionRejected(reason)))?;

        Ok(Verdict::ResponderWins)
    }

    /// Ask every peer for its mountain range and check its shape
    async fn collect_ranges(&mut self) -> Result<Vec<MountainRange>, VerifierError> {
        if self.peer_count() == 0 {
            return Err(VerifierError::NoPeers);
        }

        for peer in 0..self.peer_count() {
            self.discard_stale(peer);
            self.to[peer]
                .send(Message::GetMountainRange)
                .await
                .map_err(|_| VerifierError::ChannelClosed { peer })?;
        }

        let mut ranges = Vec::with_capacity(self.peer_count());
        for peer in 0..self.peer_count() {
            let range = match self.recv(peer, Side::Responder).await {
                Ok(Message::MountainRange(range)) => range,
                Ok(other) => {
                    return Err(VerifierError::UnexpectedReply {
                        peer,
                        got: other.kind(),
                    })
                }
                Err((_, Fault::Timeout)) => return Err(VerifierError::Timeout { peer }),
                Err(_) => return Err(VerifierError::ChannelClosed { peer }),
            };
            range
                .validate(self.config.dim)
                .map_err(|reason| VerifierError::InvalidMountainRange { peer, reason })?;
            tracing::debug!("Peer {} holds {} leaves in {} peaks", peer, range.total(), range.len());
            ranges.push(range);
        }
        Ok(ranges)
    }

    async fn send(&self, peer: usize, side: Side, msg: Message) -> Result<(), (Side, Fault)> {
        self.to[peer]
            .send(msg)
            .await
            .map_err(|_| (side, Fault::Disconnected))
    }

    async fn recv(&mut self, peer: usize, side: Side) -> Result<Message, (Side, Fault)> {
        let rx = &mut self.from[peer];
        let msg = match self.config.round_timeout {
            Some(limit) => tokio::time::timeout(limit, rx.recv())
                .await
                .map_err(|_| (side, Fault::Timeout))?,
            None => rx.recv().await,
        };
        msg.ok_or((side, Fault::Disconnected))
    }

    /// Drop replies that arrived after an earlier match was already decided
    fn discard_stale(&mut self, peer: usize) {
        while let Ok(msg) = self.from[peer].try_recv() {
            tracing::warn!("Discarding stale {} from peer {}", msg.kind(), peer);
        }
    }
}

/// Largest safe peer by total leaves; ties go to the lowest index
fn largest_safe(safe: &BTreeSet<usize>, totals: &[u64]) -> Option<(usize, u64)> {
    let mut best: Option<(usize, u64)> = None;
    for &peer in safe {
        if best.map_or(true, |(_, total)| totals[peer] > total) {
            best = Some((peer, totals[peer]));
        }
    }
    best
}

fn unexpected(expected: &'static str, got: Message) -> Fault {
    match got {
        Message::Forfeit { reason } => Fault::Forfeited(reason),
        other => Fault::UnexpectedMessage {
            expected,
            got: other.kind(),
        },
    }
}
