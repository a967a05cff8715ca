//! Session - plays either side of the bisection game for one ledger
//!
//! A session sits behind a pair of channels and answers whatever the verifier
//! sends. The message that opens a game decides the role:
//! - `MountainRange` makes this session the challenger
//! - `StartRoot` makes it the responder
//! - `GetMountainRange` just asks for the commitment
//!
//! Each of these resets the session, so one session can play any number of
//! matches. Anything that does not fit the current state is answered with a
//! `Forfeit` and the session goes back to idle.

use crate::types::Message;
use crate::CHANNEL_CAPACITY;
use ledger_forest::{Digest, Forest, ForestError, MountainRange, NodeStore};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Where a session is in the current game
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Between games, or waiting for adjudication after the last move
    Idle,
    /// Descending towards the first disagreement; `ptr` is our own node
    Challenging { ptr: Digest },
    /// Opening our tree on request; `ptr` is the node last opened
    Responding { ptr: Digest },
}

/// Local failures that stop a session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Forest error: {0}")]
    Forest(#[from] ForestError),

    #[error("Outbound channel closed")]
    ChannelClosed,
}

/// Bisection game player over one forest
pub struct Session<S: NodeStore> {
    forest: Arc<Forest<S>>,
    inbound: mpsc::Receiver<Message>,
    outbound: mpsc::Sender<Message>,
    state: SessionState,
}

/// Verifier-side ends of a spawned session
pub struct SessionHandle {
    /// Messages to the session
    pub to: mpsc::Sender<Message>,
    /// Messages from the session
    pub from: mpsc::Receiver<Message>,
    pub task: JoinHandle<Result<(), SessionError>>,
}

impl<S: NodeStore + 'static> Session<S> {
    /// Spawn a session task wired to a fresh pair of channels
    pub fn spawn(forest: Arc<Forest<S>>) -> SessionHandle {
        let (to, inbound) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound, from) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(Session::new(forest, inbound, outbound).run());
        SessionHandle { to, from, task }
    }
}

impl<S: NodeStore> Session<S> {
    pub fn new(
        forest: Arc<Forest<S>>,
        inbound: mpsc::Receiver<Message>,
        outbound: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            forest,
            inbound,
            outbound,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Answer inbound messages until the inbound channel closes
    pub async fn run(mut self) -> Result<(), SessionError> {
        while let Some(msg) = self.inbound.recv().await {
            let reply = match self.handle(msg) {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::error!("Session stopped on local failure: {}", e);
                    return Err(e.into());
                }
            };
            if let Some(reply) = reply {
                self.outbound
                    .send(reply)
                    .await
                    .map_err(|_| SessionError::ChannelClosed)?;
            }
        }
        tracing::debug!("Session inbound channel closed");
        Ok(())
    }

    /// Apply one inbound message and return the reply, if any
    pub fn handle(&mut self, msg: Message) -> Result<Option<Message>, ForestError> {
        match msg {
            Message::GetMountainRange => {
                self.state = SessionState::Idle;
                Ok(Some(Message::MountainRange(self.forest.mountain_range()?)))
            }
            Message::MountainRange(peer) => {
                self.state = SessionState::Idle;
                self.challenge(&peer)
            }
            Message::StartRoot { index } => {
                self.state = SessionState::Idle;
                let roots = self.forest.get_roots()?;
                match usize::try_from(index).ok().and_then(|i| roots.get(i)) {
                    Some(root) => self.open(*root),
                    None => Ok(self.forfeit(format!(
                        "no peak at index {} ({} peaks)",
                        index,
                        roots.len()
                    ))),
                }
            }
            Message::OpenNext { index } => match self.state {
                SessionState::Responding { ptr } => {
                    let children = self.forest.get_children(&ptr)?;
                    match usize::try_from(index).ok().and_then(|i| children.get(i)) {
                        Some(child) => self.open(*child),
                        None => Ok(self.forfeit(format!(
                            "child index {} out of range ({} children)",
                            index,
                            children.len()
                        ))),
                    }
                }
                _ => Ok(self.forfeit("OpenNext while not responding".to_string())),
            },
            Message::NextChildren { hashes } => match self.state {
                SessionState::Challenging { ptr } => self.descend(ptr, &hashes),
                _ => Ok(self.forfeit("NextChildren while not challenging".to_string())),
            },
            other @ (Message::NestedLedger
            | Message::StateTransition { .. }
            | Message::Forfeit { .. }) => {
                Ok(self.forfeit(format!("unexpected {}", other.kind())))
            }
        }
    }

    /// Compare the peer's peaks with ours and pick where to start.
    ///
    /// Each peer peak is matched against our node over the same leaves, so a
    /// shorter honest ledger is recognised as a prefix even when its peaks
    /// sit inside larger peaks of ours.
    fn challenge(&mut self, peer: &MountainRange) -> Result<Option<Message>, ForestError> {
        let mut offset = 0u64;
        for (index, (root, &size)) in peer.roots.iter().zip(&peer.sizes).enumerate() {
            let Some(ptr) = self.forest.subtree_at(offset, size)? else {
                return Ok(self.forfeit(format!(
                    "peer peak {} covers leaves {}..{} beyond our {}",
                    index,
                    offset,
                    offset.saturating_add(size),
                    self.forest.leaf_count()?
                )));
            };
            if ptr != *root {
                if !self.forest.is_leaf(&ptr)? {
                    self.state = SessionState::Challenging { ptr };
                }
                tracing::debug!("Challenging from peak {} at leaf {}", index, offset);
                return Ok(Some(Message::StartRoot { index: index as u64 }));
            }
            offset = offset.saturating_add(size);
        }

        tracing::debug!("Peer range is a prefix of ours ({} peaks)", peer.len());
        Ok(Some(Message::NestedLedger))
    }

    /// Find the first child that differs from ours and descend into it
    fn descend(&mut self, ptr: Digest, hashes: &[Digest]) -> Result<Option<Message>, ForestError> {
        let own = self.forest.get_children(&ptr)?;
        if own.len() != hashes.len() {
            return Ok(self.forfeit(format!(
                "incompatible dimensions: {} children against our {}",
                hashes.len(),
                own.len()
            )));
        }

        let Some(index) = own.iter().zip(hashes).position(|(ours, theirs)| ours != theirs) else {
            return Ok(self.forfeit("identical children in bisection game".to_string()));
        };

        let child = own[index];
        self.state = if self.forest.is_leaf(&child)? {
            SessionState::Idle
        } else {
            SessionState::Challenging { ptr: child }
        };
        Ok(Some(Message::OpenNext { index: index as u64 }))
    }

    /// Move the responder pointer to `node` and open it
    fn open(&mut self, node: Digest) -> Result<Option<Message>, ForestError> {
        if self.forest.is_leaf(&node)? {
            self.state = SessionState::Idle;
            return Ok(Some(self.reveal(&node)?));
        }
        self.state = SessionState::Responding { ptr: node };
        Ok(Some(Message::NextChildren {
            hashes: self.forest.get_children(&node)?,
        }))
    }

    fn reveal(&self, leaf: &Digest) -> Result<Message, ForestError> {
        let prev = self.forest.get_prev_sibling(leaf)?;
        let (from, from_proof) = if prev.is_zero() {
            (None, Vec::new())
        } else {
            (
                Some(self.forest.get_data(&prev)?),
                self.forest.get_proof(&prev)?,
            )
        };
        Ok(Message::StateTransition {
            from,
            from_proof,
            to: self.forest.get_data(leaf)?,
        })
    }

    fn forfeit(&mut self, reason: String) -> Option<Message> {
        tracing::warn!("Forfeiting match: {}", reason);
        self.state = SessionState::Idle;
        Some(Message::Forfeit { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_forest::{ForestBuilder, MemoryStore};

    fn forest(size: u64, dim: usize) -> Forest<MemoryStore> {
        let mut builder = ForestBuilder::new(MemoryStore::new(), dim).unwrap();
        builder.extend_to(size, |i| i.to_le_bytes().to_vec()).unwrap();
        builder.finish().unwrap()
    }

    fn session(forest: Forest<MemoryStore>) -> Session<MemoryStore> {
        let (_, inbound) = mpsc::channel(1);
        let (outbound, _) = mpsc::channel(1);
        Session::new(Arc::new(forest), inbound, outbound)
    }

    #[test]
    fn test_reports_mountain_range() {
        let mut s = session(forest(12, 3));
        match s.handle(Message::GetMountainRange).unwrap() {
            Some(Message::MountainRange(range)) => assert_eq!(range.sizes, vec![9, 3]),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_responder_walks_to_leaf() {
        let f = forest(9, 3);
        let root = f.get_roots().unwrap()[0];
        let mut s = session(f);

        let Some(Message::NextChildren { hashes }) = s.handle(Message::StartRoot { index: 0 }).unwrap() else {
            panic!("expected children");
        };
        assert_eq!(hashes.len(), 3);
        assert_eq!(s.state(), SessionState::Responding { ptr: root });

        s.handle(Message::OpenNext { index: 1 }).unwrap();
        let reply = s.handle(Message::OpenNext { index: 2 }).unwrap();
        // Leaf 5: predecessor is leaf 4
        match reply {
            Some(Message::StateTransition { from, from_proof, to }) => {
                assert_eq!(to, 5u64.to_le_bytes().to_vec());
                assert_eq!(from, Some(4u64.to_le_bytes().to_vec()));
                assert_eq!(from_proof.len(), 6);
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn test_first_leaf_has_no_predecessor() {
        let mut s = session(forest(1, 2));
        match s.handle(Message::StartRoot { index: 0 }).unwrap() {
            Some(Message::StateTransition { from, from_proof, .. }) => {
                assert_eq!(from, None);
                assert!(from_proof.is_empty());
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_nested_ledger() {
        let short = forest(9, 3).mountain_range().unwrap();
        let mut s = session(forest(12, 3));
        assert_eq!(
            s.handle(Message::MountainRange(short)).unwrap(),
            Some(Message::NestedLedger)
        );
    }

    #[test]
    fn test_nested_ledger_inside_larger_peak() {
        // Peaks [9, 1] against our [9, 3]: leaf 9 sits inside our second peak
        let short = forest(10, 3).mountain_range().unwrap();
        let mut s = session(forest(12, 3));
        assert_eq!(
            s.handle(Message::MountainRange(short)).unwrap(),
            Some(Message::NestedLedger)
        );
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn test_shorter_challenger_forfeits() {
        let long = forest(12, 3).mountain_range().unwrap();
        let mut s = session(forest(10, 3));
        assert!(matches!(
            s.handle(Message::MountainRange(long)).unwrap(),
            Some(Message::Forfeit { .. })
        ));
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn test_challenger_picks_first_different_peak() {
        let f = forest(12, 3);
        let own_second = f.get_roots().unwrap()[1];
        let mut peer = f.mountain_range().unwrap();
        peer.roots[1] = Digest::new([7u8; 32]);
        let mut s = session(f);

        assert_eq!(
            s.handle(Message::MountainRange(peer)).unwrap(),
            Some(Message::StartRoot { index: 1 })
        );
        assert_eq!(s.state(), SessionState::Challenging { ptr: own_second });
    }

    #[test]
    fn test_challenger_starts_below_own_peak() {
        // Peer peaks [9, 1, 1] with leaf 10 replaced; ours are [9, 3]
        let f = forest(12, 3);
        let mut peer = f.mountain_range().unwrap();
        peer.roots = vec![peer.roots[0], f.leaf_at(9).unwrap(), Digest::new([7u8; 32])];
        peer.sizes = vec![9, 1, 1];
        let mut s = session(f);

        // The disputed peak is a single leaf, nothing left to descend
        assert_eq!(
            s.handle(Message::MountainRange(peer)).unwrap(),
            Some(Message::StartRoot { index: 2 })
        );
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn test_challenger_descends_and_rejects_bad_children() {
        let f = forest(9, 3);
        let mut s = session(f);
        let mut peer = forest(9, 3).mountain_range().unwrap();
        peer.roots[0] = Digest::new([7u8; 32]);
        assert_eq!(
            s.handle(Message::MountainRange(peer.clone())).unwrap(),
            Some(Message::StartRoot { index: 0 })
        );

        // Wrong number of children
        let reply = s
            .handle(Message::NextChildren { hashes: vec![Digest::ZERO; 2] })
            .unwrap();
        assert!(matches!(reply, Some(Message::Forfeit { .. })));
        assert_eq!(s.state(), SessionState::Idle);

        // Identical children
        s.handle(Message::MountainRange(peer.clone())).unwrap();
        let SessionState::Challenging { ptr } = s.state() else {
            panic!("expected challenging state");
        };
        let own = s.forest.get_children(&ptr).unwrap();
        let reply = s.handle(Message::NextChildren { hashes: own.clone() }).unwrap();
        assert!(matches!(reply, Some(Message::Forfeit { .. })));

        // A differing second child is chosen
        s.handle(Message::MountainRange(peer.clone())).unwrap();
        let mut theirs = own.clone();
        theirs[1] = Digest::new([9u8; 32]);
        assert_eq!(
            s.handle(Message::NextChildren { hashes: theirs }).unwrap(),
            Some(Message::OpenNext { index: 1 })
        );
        assert_eq!(s.state(), SessionState::Challenging { ptr: own[1] });
    }

    #[test]
    fn test_out_of_turn_messages_forfeit() {
        let mut s = session(forest(9, 3));
        for msg in [
            Message::OpenNext { index: 0 },
            Message::NextChildren { hashes: vec![] },
            Message::NestedLedger,
            Message::Forfeit { reason: "x".into() },
            Message::StartRoot { index: 4 },
        ] {
            assert!(matches!(s.handle(msg).unwrap(), Some(Message::Forfeit { .. })));
            assert_eq!(s.state(), SessionState::Idle);
        }

        s.handle(Message::StartRoot { index: 0 }).unwrap();
        assert!(matches!(
            s.handle(Message::OpenNext { index: 3 }).unwrap(),
            Some(Message::Forfeit { .. })
        ));
    }

    #[tokio::test]
    async fn test_spawned_session_stops_when_inbound_closes() {
        let handle = Session::spawn(Arc::new(forest(4, 2)));
        let SessionHandle { to, mut from, task } = handle;

        to.send(Message::GetMountainRange).await.unwrap();
        assert!(matches!(from.recv().await, Some(Message::MountainRange(_))));

        drop(to);
        assert!(task.await.unwrap().is_ok());
        assert!(from.recv().await.is_none());
    }
}
