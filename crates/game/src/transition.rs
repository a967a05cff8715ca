//! Extension point for state transition checks
//!
//! A match only proves that the revealed leaves are the ones committed in the
//! responder's peaks. Whether the step from the previous leaf to the disputed
//! one is a legal state transition is application specific; the verifier asks
//! a `TransitionValidator` and treats a rejection as a loss for the responder.

/// Judges the transition from one leaf to the next
pub trait TransitionValidator: Send + Sync {
    /// `from` is absent when `index` is the first leaf of the ledger
    fn validate(&self, from: Option<&[u8]>, to: &[u8], index: u64) -> Result<(), String>;
}

/// Accepts every transition
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl TransitionValidator for AcceptAll {
    fn validate(&self, _from: Option<&[u8]>, _to: &[u8], _index: u64) -> Result<(), String> {
        Ok(())
    }
}

impl<F> TransitionValidator for F
where
    F: Fn(Option<&[u8]>, &[u8], u64) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, from: Option<&[u8]>, to: &[u8], index: u64) -> Result<(), String> {
        self(from, to, index)
    }
}
