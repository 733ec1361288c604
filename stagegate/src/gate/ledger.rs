//! Per-epoch trigger deduplication.

use crate::core::{StageId, TriggerReason, WorkKey};
use dashmap::DashMap;

#[derive(Debug, Clone, Copy, Default)]
struct LedgerEntry {
    epoch: u64,
    fired: Option<TriggerReason>,
}

/// Records which `(next_stage, work_key)` pairs have been triggered.
///
/// At most one trigger is claimed per pair per epoch; a claim is atomic so
/// concurrent completion events cannot both win.
#[derive(Debug, Default)]
pub struct TriggerLedger {
    entries: DashMap<(StageId, WorkKey), LedgerEntry>,
}

impl TriggerLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the trigger for the current epoch. Returns the epoch on
    /// success, `None` if a trigger was already claimed.
    pub fn try_claim(
        &self,
        next_stage: &StageId,
        work_key: &WorkKey,
        reason: TriggerReason,
    ) -> Option<u64> {
        let mut entry = self
            .entries
            .entry((next_stage.clone(), work_key.clone()))
            .or_default();
        if entry.fired.is_some() {
            return None;
        }
        entry.fired = Some(reason);
        Some(entry.epoch)
    }

    /// Gives back a claim that could not be delivered.
    pub fn release(&self, next_stage: &StageId, work_key: &WorkKey, epoch: u64) {
        if let Some(mut entry) = self.entries.get_mut(&(next_stage.clone(), work_key.clone())) {
            if entry.epoch == epoch {
                entry.fired = None;
            }
        }
    }

    /// Starts a new epoch, allowing one more trigger. Returns the new epoch.
    pub fn rearm(&self, next_stage: &StageId, work_key: &WorkKey) -> u64 {
        let mut entry = self
            .entries
            .entry((next_stage.clone(), work_key.clone()))
            .or_default();
        entry.epoch += 1;
        entry.fired = None;
        entry.epoch
    }

    /// Returns how the current epoch was triggered, if it was.
    #[must_use]
    pub fn fired(&self, next_stage: &StageId, work_key: &WorkKey) -> Option<TriggerReason> {
        self.entries
            .get(&(next_stage.clone(), work_key.clone()))
            .and_then(|entry| entry.fired)
    }

    /// Returns the current epoch.
    #[must_use]
    pub fn epoch(&self, next_stage: &StageId, work_key: &WorkKey) -> u64 {
        self.entries
            .get(&(next_stage.clone(), work_key.clone()))
            .map_or(0, |entry| entry.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> (StageId, WorkKey) {
        (StageId::from("aggregate"), WorkKey::from("D"))
    }

    #[test]
    fn test_single_claim_per_epoch() {
        let ledger = TriggerLedger::new();
        let (stage, work) = key();

        assert_eq!(ledger.try_claim(&stage, &work, TriggerReason::Full), Some(0));
        assert_eq!(ledger.try_claim(&stage, &work, TriggerReason::Full), None);
        assert_eq!(ledger.fired(&stage, &work), Some(TriggerReason::Full));
    }

    #[test]
    fn test_rearm_opens_new_epoch() {
        let ledger = TriggerLedger::new();
        let (stage, work) = key();

        ledger.try_claim(&stage, &work, TriggerReason::ForcedPartial);
        assert_eq!(ledger.rearm(&stage, &work), 1);
        assert_eq!(ledger.fired(&stage, &work), None);
        assert_eq!(ledger.try_claim(&stage, &work, TriggerReason::Full), Some(1));
    }

    #[test]
    fn test_release_ignores_other_epochs() {
        let ledger = TriggerLedger::new();
        let (stage, work) = key();

        ledger.try_claim(&stage, &work, TriggerReason::Full);
        ledger.rearm(&stage, &work);
        ledger.try_claim(&stage, &work, TriggerReason::Full);
        ledger.release(&stage, &work, 0);
        assert!(ledger.fired(&stage, &work).is_some());

        ledger.release(&stage, &work, 1);
        assert!(ledger.fired(&stage, &work).is_none());
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let ledger = std::sync::Arc::new(TriggerLedger::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    let (stage, work) = key();
                    ledger.try_claim(&stage, &work, TriggerReason::Full).is_some()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .filter_map(|h| h.join().ok())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
