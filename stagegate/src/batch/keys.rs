//! Consolidation keys.

use crate::core::{EntityId, WorkKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Integer form of an optional floating-point variant.
///
/// Some destination stores reject floating-point partition expressions, so
/// variants are scaled to thousandths and rounded; a missing or non-finite
/// value becomes a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariantId(i64);

impl VariantId {
    /// Sentinel for a missing variant.
    pub const NONE: Self = Self(i64::MIN);

    const SCALE: f64 = 1000.0;

    /// Normalizes an optional float.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_f64(value: Option<f64>) -> Self {
        match value {
            Some(v) if v.is_finite() => {
                // `as` saturates; keep clear of the sentinel.
                Self(((v * Self::SCALE).round() as i64).max(i64::MIN + 1))
            }
            _ => Self::NONE,
        }
    }

    /// Wraps an already-integral variant.
    #[must_use]
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns true for the missing-variant sentinel.
    #[must_use]
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    /// The stored integer.
    #[must_use]
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl Default for VariantId {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for VariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Idempotent merge key `(work_key, entity_id, variant_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsolidationKey {
    /// Partition.
    pub work_key: WorkKey,
    /// Entity the row describes.
    pub entity_id: EntityId,
    /// Variant, or the null sentinel.
    pub variant_id: VariantId,
}

impl ConsolidationKey {
    /// Builds a key, normalizing the variant.
    #[must_use]
    pub fn new(
        work_key: impl Into<WorkKey>,
        entity_id: impl Into<EntityId>,
        variant: Option<f64>,
    ) -> Self {
        Self {
            work_key: work_key.into(),
            entity_id: entity_id.into(),
            variant_id: VariantId::from_f64(variant),
        }
    }

    /// Stable hex digest of the key, usable as a row id.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.work_key.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.entity_id.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.variant_id.value().to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for ConsolidationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.work_key, self.entity_id, self.variant_id)
    }
}
