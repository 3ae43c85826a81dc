//! Per-session patch store.
//!
//! Patches are kept in issuance order and never removed or renumbered; older ones
//! stay as an audit trail. Sequence numbers come from a counter behind the same
//! lock as the list, so overlapping `create` calls can never share a number.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::core::patch::{Patch, TransitionError, Validation};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("no patch with sequence number {0}")]
    Unknown(u32),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Default)]
struct StoreInner {
    last_seq: u32,
    patches: Vec<Patch>,
}

#[derive(Debug, Default)]
pub struct PatchStore {
    inner: Mutex<StoreInner>,
}

impl PatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve the next sequence number (1-based, never reused).
    pub fn next_patch_id(&self) -> u32 {
        let mut inner = self.lock();
        inner.last_seq += 1;
        inner.last_seq
    }

    /// Create an `unchecked`/`pending` patch with the next sequence number.
    pub fn create(&self, diff: impl Into<String>, created_at: impl Into<String>) -> Patch {
        let mut inner = self.lock();
        inner.last_seq += 1;
        let patch = Patch::new(inner.last_seq, diff, created_at);
        inner.patches.push(patch.clone());
        patch
    }

    /// Mutate one patch in place and return a snapshot of the result.
    ///
    /// The closure is expected to go through `Patch` transition methods, which is
    /// where the state machine is enforced.
    pub fn record<F>(&self, seq: u32, f: F) -> Result<Patch, StoreError>
    where
        F: FnOnce(&mut Patch) -> Result<(), TransitionError>,
    {
        let mut inner = self.lock();
        let patch = inner
            .patches
            .iter_mut()
            .find(|p| p.seq == seq)
            .ok_or(StoreError::Unknown(seq))?;
        f(patch)?;
        Ok(patch.clone())
    }

    pub fn get(&self, seq: u32) -> Option<Patch> {
        self.lock().patches.iter().find(|p| p.seq == seq).cloned()
    }

    /// Most recently validated `valid` patch, whatever its apply state.
    ///
    /// Approval always targets this one. Whether it can still be applied is the
    /// state machine's call, so an applied patch here yields a duplicate-apply
    /// error rather than falling back to an older patch.
    pub fn latest_valid(&self) -> Option<Patch> {
        self.lock()
            .patches
            .iter()
            .rev()
            .find(|p| p.validation == Validation::Valid)
            .cloned()
    }

    pub fn all(&self) -> Vec<Patch> {
        self.lock().patches.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
