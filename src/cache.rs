//! Explicit cross-request memoization of signature matrices

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::resample::{Frequency, Statistic};
use crate::signatures::SignatureMatrix;

/// Memoizes signature matrices per (frequency, statistic).
///
/// Owned explicitly by the host — never global state. Must be invalidated
/// whenever new raw data is ingested; entries are otherwise reused across
/// requests.
pub struct SignatureCache {
    entries: Mutex<HashMap<(Frequency, Statistic), Arc<SignatureMatrix>>>,
}

impl SignatureCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached matrix for this key, or compute and cache it.
    ///
    /// The lock is not held during `compute`, so two concurrent misses on
    /// the same key may both compute; the first insert wins and both
    /// callers see the same matrix afterwards.
    pub fn get_or_compute(
        &self,
        frequency: Frequency,
        statistic: Statistic,
        compute: impl FnOnce() -> SignatureMatrix,
    ) -> Arc<SignatureMatrix> {
        let key = (frequency, statistic);
        if let Some(hit) = self.entries.lock().expect("cache lock").get(&key) {
            log::debug!(
                "signature cache hit for {}/{}",
                frequency.as_str(),
                statistic.as_str()
            );
            return Arc::clone(hit);
        }

        let computed = Arc::new(compute());
        let mut entries = self.entries.lock().expect("cache lock");
        Arc::clone(entries.entry(key).or_insert(computed))
    }

    /// Drop every entry. Call on new raw-data ingestion.
    pub fn invalidate(&self) {
        let mut entries = self.entries.lock().expect("cache lock");
        let dropped = entries.len();
        entries.clear();
        if dropped > 0 {
            log::info!("signature cache invalidated ({} entries dropped)", dropped);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SignatureCache {
    fn default() -> Self {
        Self::new()
    }
}
