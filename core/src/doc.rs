use std::sync::Arc;

use anyhow::{Context, Result};
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// Binary merge capability for one CRDT flavour.
///
/// Implementations must tolerate re-application of updates already reflected
/// in `state`: compaction relies on it to recover from a crash between the
/// snapshot write and the log cleanup.
pub trait DocMerger: Send + Sync {
    /// Encoded state of an empty document.
    fn identity(&self) -> Vec<u8>;

    fn merge(&self, state: &[u8], update: &[u8]) -> Result<Vec<u8>>;

    /// Apply `updates` to `base` (identity when absent) left to right.
    fn fold(&self, base: Option<&[u8]>, updates: &[&[u8]]) -> Result<Vec<u8>> {
        let mut state = match base {
            Some(bytes) => bytes.to_vec(),
            None => self.identity(),
        };
        for update in updates {
            state = self.merge(&state, update)?;
        }
        Ok(state)
    }

    /// Encode the part of `state` a peer at `state_vector` is missing.
    fn diff(&self, state: &[u8], _state_vector: &[u8]) -> Result<Vec<u8>> {
        Ok(state.to_vec())
    }
}

pub type DocMergerRef = Arc<dyn DocMerger>;

/// Yjs v1 update merging backed by `yrs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct YrsMerger;

impl YrsMerger {
    pub fn new() -> Self {
        Self
    }

    pub fn shared() -> DocMergerRef {
        Arc::new(Self)
    }

    fn load(snapshot: Option<&[u8]>) -> Result<Doc> {
        let doc = Doc::new();
        if let Some(bytes) = snapshot.filter(|bytes| !bytes.is_empty()) {
            let update = Update::decode_v1(bytes).context("decode document snapshot")?;
            doc.transact_mut()
                .apply_update(update)
                .context("apply document snapshot")?;
        }
        Ok(doc)
    }

    fn encode(doc: &Doc) -> Vec<u8> {
        doc.transact()
            .encode_state_as_update_v1(&StateVector::default())
    }
}

impl DocMerger for YrsMerger {
    fn identity(&self) -> Vec<u8> {
        Self::encode(&Doc::new())
    }

    fn merge(&self, state: &[u8], update: &[u8]) -> Result<Vec<u8>> {
        self.fold(Some(state), &[update])
    }

    fn fold(&self, base: Option<&[u8]>, updates: &[&[u8]]) -> Result<Vec<u8>> {
        if updates.is_empty() {
            return Ok(base.map_or_else(|| self.identity(), <[u8]>::to_vec));
        }

        let doc = Self::load(base)?;
        {
            let mut txn = doc.transact_mut();
            for (index, bytes) in updates.iter().enumerate() {
                let update = Update::decode_v1(bytes)
                    .with_context(|| format!("decode document update #{index}"))?;
                txn.apply_update(update)
                    .with_context(|| format!("apply document update #{index}"))?;
            }
        }
        Ok(Self::encode(&doc))
    }

    fn diff(&self, state: &[u8], state_vector: &[u8]) -> Result<Vec<u8>> {
        let remote = if state_vector.is_empty() {
            StateVector::default()
        } else {
            StateVector::decode_v1(state_vector).context("decode state vector")?
        };
        let doc = Self::load(Some(state))?;
        let diff = doc.transact().encode_state_as_update_v1(&remote);
        Ok(diff)
    }
}
