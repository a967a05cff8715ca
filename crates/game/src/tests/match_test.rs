//! Single matches between honest and dishonest sessions

use super::{honest, ledger, tampered, verifier, Ledger};
use crate::transition::TransitionValidator;
use crate::types::{Message, VerifierConfig};
use crate::verifier::{Fault, MatchOutcome, MatchReport};
use ledger_forest::{Digest, MerkleHasher};
use std::time::Duration;
use tokio::sync::mpsc;

async fn honest_match(challenger: &Ledger, responder: &Ledger, dim: usize) -> MatchReport {
    let pmr = responder.mountain_range().unwrap();
    let mut v = verifier(
        vec![honest(challenger), honest(responder)],
        VerifierConfig::new(dim),
    );
    v.run_match(0, 1, &pmr).await.unwrap()
}

fn responder_won(report: &MatchReport) -> bool {
    report.outcome == MatchOutcome::Winner { winner: 1, loser: 0 }
}

fn challenger_won(report: &MatchReport) -> bool {
    report.outcome == MatchOutcome::Winner { winner: 0, loser: 1 }
}

#[tokio::test]
async fn test_match_locates_differing_leaf() {
    let original = ledger(125, 5, None);
    let altered = ledger(125, 5, Some(96));

    let report = honest_match(&original, &altered, 5).await;
    assert_eq!(report.disputed_leaf, Some(96));
    assert!(responder_won(&report));
    assert_eq!(report.fault, None);

    // Swapping roles finds the same leaf
    let report = honest_match(&altered, &original, 5).await;
    assert_eq!(report.disputed_leaf, Some(96));
    assert!(responder_won(&report));
}

#[tokio::test]
async fn test_match_across_peaks() {
    // Peaks [125, 25]; 125 is the first leaf of the second peak
    for k in [0u64, 1, 124, 125, 130, 149] {
        let original = ledger(150, 5, None);
        let altered = ledger(150, 5, Some(k));
        let report = honest_match(&original, &altered, 5).await;
        assert_eq!(report.disputed_leaf, Some(k), "diverging at {}", k);
        assert!(responder_won(&report));
        assert_eq!(report.fault, None);
    }
}

#[tokio::test]
async fn test_random_divergence_points() {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    for _ in 0..5 {
        let dim = rng.gen_range(2..=6);
        let size = rng.gen_range(1..200u64);
        let k = rng.gen_range(0..size);
        let report = honest_match(&ledger(size, dim, None), &ledger(size, dim, Some(k)), dim).await;
        assert_eq!(report.disputed_leaf, Some(k), "size {} dim {}", size, dim);
        assert!(responder_won(&report));
    }
}

#[tokio::test]
async fn test_prefix_is_both_win() {
    let short = ledger(125, 5, None);
    let long = ledger(150, 5, None);
    let report = honest_match(&long, &short, 5).await;
    assert_eq!(report.outcome, MatchOutcome::BothWin);
    assert_eq!(report.disputed_leaf, None);
}

#[tokio::test]
async fn test_shorter_challenger_loses_to_longer_responder() {
    // Peaks [125, 125, 5, 5, 5, 5, 1, 1, 1] against [125, 125, 25, 5, 5, 5, 5, 1, 1, 1, 1]
    let short = ledger(273, 5, None);
    let long = ledger(299, 5, None);
    assert_eq!(long.get_subtree_sizes().unwrap(), vec![125, 125, 25, 5, 5, 5, 5, 1, 1, 1, 1]);

    let report = honest_match(&short, &long, 5).await;
    assert_ne!(report.outcome, MatchOutcome::BothWin);
    assert!(responder_won(&report));
    assert!(matches!(report.fault, Some(Fault::Forfeited(_))));
}

#[tokio::test]
async fn test_longer_challenger_finds_leaf_inside_shared_peak() {
    // [125, 25] against [125]
    let long = ledger(150, 5, None);
    let short = ledger(125, 5, Some(96));
    let report = honest_match(&long, &short, 5).await;
    assert_eq!(report.disputed_leaf, Some(96));
    assert!(responder_won(&report));
    assert_eq!(report.fault, None);

    // The responder's small peaks sit inside the challenger's 25-leaf peak
    for k in [100u64, 255, 260, 264, 271] {
        let long = ledger(299, 5, None);
        let short = ledger(273, 5, Some(k));
        let report = honest_match(&long, &short, 5).await;
        assert_eq!(report.disputed_leaf, Some(k), "diverging at {}", k);
        assert!(responder_won(&report));
        assert_eq!(report.fault, None);
    }
}

#[tokio::test]
async fn test_forged_children_lose() {
    let original = ledger(125, 5, None);
    let altered = ledger(125, 5, Some(40));
    let pmr = altered.mountain_range().unwrap();

    let liar = tampered(&altered, |msg| match msg {
        Message::NextChildren { mut hashes } => {
            hashes[0] = Digest::new([0xee; 32]);
            Message::NextChildren { hashes }
        }
        other => other,
    });
    let mut v = verifier(vec![honest(&original), liar], VerifierConfig::new(5));
    let report = v.run_match(0, 1, &pmr).await.unwrap();
    assert!(challenger_won(&report));
    assert_eq!(report.fault, Some(Fault::HashMismatch { round: 1 }));

    let short = tampered(&altered, |msg| match msg {
        Message::NextChildren { mut hashes } => {
            hashes.pop();
            Message::NextChildren { hashes }
        }
        other => other,
    });
    let mut v = verifier(vec![honest(&original), short], VerifierConfig::new(5));
    let report = v.run_match(0, 1, &pmr).await.unwrap();
    assert!(challenger_won(&report));
    assert_eq!(
        report.fault,
        Some(Fault::DimensionMismatch { expected: 5, actual: 4 })
    );
}

#[tokio::test]
async fn test_forged_reveal_loses() {
    let original = ledger(125, 5, None);
    let altered = ledger(125, 5, Some(40));
    let pmr = altered.mountain_range().unwrap();

    let wrong_leaf = tampered(&altered, |msg| match msg {
        Message::StateTransition { from, from_proof, .. } => Message::StateTransition {
            from,
            from_proof,
            to: 40u64.to_le_bytes().to_vec(),
        },
        other => other,
    });
    let mut v = verifier(vec![honest(&original), wrong_leaf], VerifierConfig::new(5));
    let report = v.run_match(0, 1, &pmr).await.unwrap();
    assert!(challenger_won(&report));
    assert_eq!(report.disputed_leaf, Some(40));
    assert_eq!(report.fault, Some(Fault::LeafMismatch));

    let wrong_proof = tampered(&altered, |msg| match msg {
        Message::StateTransition { from, mut from_proof, to } => {
            from_proof.truncate(5);
            Message::StateTransition { from, from_proof, to }
        }
        other => other,
    });
    let mut v = verifier(vec![honest(&original), wrong_proof], VerifierConfig::new(5));
    let report = v.run_match(0, 1, &pmr).await.unwrap();
    assert!(challenger_won(&report));
    assert_eq!(report.fault, Some(Fault::BadPredecessorProof));

    let no_predecessor = tampered(&altered, |msg| match msg {
        Message::StateTransition { to, .. } => Message::StateTransition {
            from: None,
            from_proof: vec![],
            to,
        },
        other => other,
    });
    let mut v = verifier(vec![honest(&original), no_predecessor], VerifierConfig::new(5));
    let report = v.run_match(0, 1, &pmr).await.unwrap();
    assert_eq!(report.fault, Some(Fault::BadPredecessorProof));
}

#[tokio::test]
async fn test_predecessor_from_wrong_position_loses() {
    let original = ledger(125, 5, None);
    let altered = ledger(125, 5, Some(40));
    let pmr = altered.mountain_range().unwrap();

    // Leaf 37 is committed under the same peak but does not precede leaf 40
    let stale = altered.leaf_at(37).unwrap();
    let stale_proof = altered.get_proof(&stale).unwrap();
    assert!(altered
        .hasher()
        .check_proof(&37u64.to_le_bytes(), &stale_proof, &pmr.roots));

    let skipped = tampered(&altered, move |msg| match msg {
        Message::StateTransition { to, .. } => Message::StateTransition {
            from: Some(37u64.to_le_bytes().to_vec()),
            from_proof: stale_proof.clone(),
            to,
        },
        other => other,
    });
    let mut v = verifier(vec![honest(&original), skipped], VerifierConfig::new(5));
    let report = v.run_match(0, 1, &pmr).await.unwrap();
    assert!(challenger_won(&report));
    assert_eq!(report.disputed_leaf, Some(40));
    assert_eq!(report.fault, Some(Fault::BadPredecessorProof));

    // Across a peak boundary: leaf 125 must follow the last leaf of the first peak
    let original = ledger(150, 5, None);
    let altered = ledger(150, 5, Some(125));
    let pmr = altered.mountain_range().unwrap();
    let first = altered.leaf_at(0).unwrap();
    let first_proof = altered.get_proof(&first).unwrap();

    let skipped = tampered(&altered, move |msg| match msg {
        Message::StateTransition { to, .. } => Message::StateTransition {
            from: Some(0u64.to_le_bytes().to_vec()),
            from_proof: first_proof.clone(),
            to,
        },
        other => other,
    });
    let mut v = verifier(vec![honest(&original), skipped], VerifierConfig::new(5));
    let report = v.run_match(0, 1, &pmr).await.unwrap();
    assert!(challenger_won(&report));
    assert_eq!(report.disputed_leaf, Some(125));
    assert_eq!(report.fault, Some(Fault::BadPredecessorProof));
}

#[tokio::test]
async fn test_predecessor_for_first_leaf_loses() {
    let original = ledger(25, 5, None);
    let altered = ledger(25, 5, Some(0));
    let pmr = altered.mountain_range().unwrap();

    let invented = tampered(&altered, |msg| match msg {
        Message::StateTransition { to, .. } => Message::StateTransition {
            from: Some(b"genesis".to_vec()),
            from_proof: vec![],
            to,
        },
        other => other,
    });
    let mut v = verifier(vec![honest(&original), invented], VerifierConfig::new(5));
    let report = v.run_match(0, 1, &pmr).await.unwrap();
    assert!(challenger_won(&report));
    assert_eq!(report.disputed_leaf, Some(0));
    assert_eq!(report.fault, Some(Fault::UnexpectedPredecessor));
}

#[tokio::test]
async fn test_forged_challenger_moves_lose() {
    let original = ledger(125, 5, None);
    let altered = ledger(125, 5, Some(7));
    let pmr = altered.mountain_range().unwrap();

    let bad_open = tampered(&original, |msg| match msg {
        Message::OpenNext { .. } => Message::OpenNext { index: 5 },
        other => other,
    });
    let mut v = verifier(vec![bad_open, honest(&altered)], VerifierConfig::new(5));
    let report = v.run_match(0, 1, &pmr).await.unwrap();
    assert!(responder_won(&report));
    assert_eq!(report.fault, Some(Fault::IndexOutOfRange { index: 5, bound: 5 }));

    let bad_start = tampered(&original, |msg| match msg {
        Message::StartRoot { .. } => Message::StartRoot { index: 3 },
        other => other,
    });
    let mut v = verifier(vec![bad_start, honest(&altered)], VerifierConfig::new(5));
    let report = v.run_match(0, 1, &pmr).await.unwrap();
    assert!(responder_won(&report));
    assert_eq!(report.fault, Some(Fault::IndexOutOfRange { index: 3, bound: 1 }));

    let wrong_kind = tampered(&original, |msg| match msg {
        Message::OpenNext { .. } => Message::NestedLedger,
        other => other,
    });
    let mut v = verifier(vec![wrong_kind, honest(&altered)], VerifierConfig::new(5));
    let report = v.run_match(0, 1, &pmr).await.unwrap();
    assert!(responder_won(&report));
    assert_eq!(
        report.fault,
        Some(Fault::UnexpectedMessage {
            expected: "OpenNext",
            got: "NestedLedger"
        })
    );
}

#[tokio::test]
async fn test_rejected_transition_loses() {
    let original = ledger(25, 5, None);
    let altered = ledger(25, 5, Some(12));
    let pmr = altered.mountain_range().unwrap();

    let only_counters = |_from: Option<&[u8]>, to: &[u8], index: u64| {
        if to == &index.to_le_bytes()[..] {
            Ok(())
        } else {
            Err(format!("leaf {} is not a counter", index))
        }
    };
    assert!(only_counters.validate(None, &3u64.to_le_bytes(), 3).is_ok());

    let mut v = verifier(vec![honest(&original), honest(&altered)], VerifierConfig::new(5))
        .with_transition_validator(only_counters);
    let report = v.run_match(0, 1, &pmr).await.unwrap();
    assert!(challenger_won(&report));
    assert_eq!(report.disputed_leaf, Some(12));
    assert!(matches!(report.fault, Some(Fault::TransitionRejected(_))));
}

#[tokio::test]
async fn test_silent_responder_times_out() {
    let original = ledger(25, 5, None);
    let altered = ledger(25, 5, Some(3));
    let pmr = altered.mountain_range().unwrap();

    // Accepts messages but never answers
    let (to, _inbox) = mpsc::channel(8);
    let (_outbox, from) = mpsc::channel(8);

    let config = VerifierConfig::new(5).with_round_timeout(Duration::from_millis(50));
    let mut v = verifier(vec![honest(&original), (to, from)], config);
    let report = v.run_match(0, 1, &pmr).await.unwrap();
    assert!(challenger_won(&report));
    assert_eq!(report.fault, Some(Fault::Timeout));
}

#[tokio::test]
async fn test_disconnected_responder_loses() {
    let original = ledger(25, 5, None);
    let altered = ledger(25, 5, Some(3));
    let pmr = altered.mountain_range().unwrap();

    let (to, inbox) = mpsc::channel(8);
    let (outbox, from) = mpsc::channel::<Message>(8);
    drop(inbox);
    drop(outbox);

    let mut v = verifier(vec![honest(&original), (to, from)], VerifierConfig::new(5));
    let report = v.run_match(0, 1, &pmr).await.unwrap();
    assert!(challenger_won(&report));
    assert_eq!(report.fault, Some(Fault::Disconnected));
}

#[tokio::test]
async fn test_sessions_play_consecutive_matches() {
    let a = ledger(125, 5, None);
    let b = ledger(125, 5, Some(33));
    let pmr_a = a.mountain_range().unwrap();
    let pmr_b = b.mountain_range().unwrap();

    let mut v = verifier(vec![honest(&a), honest(&b)], VerifierConfig::new(5));
    for _ in 0..3 {
        let report = v.run_match(0, 1, &pmr_b).await.unwrap();
        assert_eq!(report.disputed_leaf, Some(33));
        assert!(responder_won(&report));

        let report = v.run_match(1, 0, &pmr_a).await.unwrap();
        assert_eq!(report.disputed_leaf, Some(33));
        assert_eq!(report.winner(), Some(0));
    }
}
