//! Weighted variant selection.
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{error::AssignmentError, models::VariantOption};

/// Number of distinct seed values.
pub const SEED_RANGE: u32 = 100;

/// Per-user random number in `[0, 100)` that, together with variant weights, determines which
/// variant the user gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Seed(u32);

impl Seed {
    /// Returns `None` if the value is outside of `[0, 100)`.
    pub fn new(value: u32) -> Option<Seed> {
        (value < SEED_RANGE).then_some(Seed(value))
    }

    /// Draw a uniformly random seed.
    pub fn generate() -> Seed {
        Seed(rand::thread_rng().gen_range(0..SEED_RANGE))
    }

    /// Derive a seed from the user id, so that the same user gets the same seed on every device.
    pub fn from_user_id(user_id: &str) -> Seed {
        let hash = md5::compute(user_id);
        let value = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
        Seed(value % SEED_RANGE)
    }

    #[allow(missing_docs)]
    pub fn value(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for Seed {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Seed::new(value).ok_or_else(|| format!("seed {value} is out of range"))
    }
}

impl From<Seed> for u32 {
    fn from(value: Seed) -> u32 {
        value.0
    }
}

/// Pick a variant for the given seed.
///
/// Weights are relative and do not need to sum to 100. The seed is scaled into `[0, total)` and
/// each variant owns a half-open interval of the cumulative weights, in list order. If all weights
/// are zero, the first variant is picked.
pub fn choose_variant(
    variants: &[VariantOption],
    seed: Seed,
) -> Result<&VariantOption, AssignmentError> {
    let first = variants.first().ok_or(AssignmentError::NoVariantsFound)?;

    let total: u64 = variants
        .iter()
        .map(|variant| u64::from(variant.percentage_weight))
        .sum();
    if total == 0 {
        return Ok(first);
    }

    let point = u64::from(seed.value()) * total / u64::from(SEED_RANGE);
    let mut cumulative = 0;
    for variant in variants {
        cumulative += u64::from(variant.percentage_weight);
        if point < cumulative {
            return Ok(variant);
        }
    }

    // point < total, so the loop always returns.
    Ok(first)
}
