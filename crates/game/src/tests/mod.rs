//! End-to-end games between live sessions

mod match_test;

use crate::session::{Session, SessionHandle};
use crate::types::{Message, VerifierConfig};
use crate::verifier::Verifier;
use crate::CHANNEL_CAPACITY;
use ledger_forest::{Forest, ForestBuilder, MemoryStore};
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) type Ledger = Arc<Forest<MemoryStore>>;

/// Leaf `i` holds `i` as little-endian bytes; a corrupted leaf gets a suffix
pub(crate) fn ledger(size: u64, dim: usize, corrupt: Option<u64>) -> Ledger {
    let mut builder = ForestBuilder::new(MemoryStore::new(), dim).unwrap();
    builder
        .extend_to(size, |i| {
            let mut data = i.to_le_bytes().to_vec();
            if corrupt == Some(i) {
                data.extend_from_slice(b"diff");
            }
            data
        })
        .unwrap();
    Arc::new(builder.finish().unwrap())
}

pub(crate) type Peer = (mpsc::Sender<Message>, mpsc::Receiver<Message>);

pub(crate) fn honest(ledger: &Ledger) -> Peer {
    let SessionHandle { to, from, .. } = Session::spawn(ledger.clone());
    (to, from)
}

/// A session whose replies pass through `tamper` on the way out
pub(crate) fn tampered<F>(ledger: &Ledger, mut tamper: F) -> Peer
where
    F: FnMut(Message) -> Message + Send + 'static,
{
    let SessionHandle { to, mut from, .. } = Session::spawn(ledger.clone());
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(msg) = from.recv().await {
            if tx.send(tamper(msg)).await.is_err() {
                break;
            }
        }
    });
    (to, rx)
}

pub(crate) fn verifier(peers: Vec<Peer>, config: VerifierConfig) -> Verifier {
    let (to, from) = peers.into_iter().unzip();
    Verifier::new(to, from, config).unwrap()
}
