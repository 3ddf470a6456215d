//! Session rotation policy.
//!
//! Pure functions: when an agent's context grows past a fixed budget
//! the runtime adapter starts a fresh session and carries over a tiered
//! view of the conversation (newest turns verbatim, older turns
//! progressively compressed, the rest dropped).

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Context size at which a session must be rotated.
pub const ROTATION_THRESHOLD_TOKENS: u64 = 100_000;

/// How many of the most recent turns are kept at each fidelity.
///
/// Counts are cumulative: the newest `recent_full` turns are kept
/// verbatim, turns up to `recent_detailed` are kept in detail, and
/// turns up to `recent_summary` are summarised.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MemoryTierPlan {
    /// Turns kept verbatim.
    pub recent_full: u32,
    /// Turns kept in detail.
    pub recent_detailed: u32,
    /// Turns kept as summaries.
    pub recent_summary: u32,
}

/// Fidelity at which one turn is carried into a rotated session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    /// Verbatim.
    Full,
    /// Detailed digest.
    Detailed,
    /// One-line summary.
    Summary,
    /// Not carried over.
    Dropped,
}

impl MemoryTierPlan {
    /// Build a plan, enforcing `recent_summary >= recent_detailed >= recent_full`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the ordering is violated.
    pub fn new(recent_full: u32, recent_detailed: u32, recent_summary: u32) -> Result<Self> {
        if recent_full > recent_detailed || recent_detailed > recent_summary {
            return Err(AppError::Validation(format!(
                "tier plan must satisfy summary >= detailed >= full \
                 (got {recent_summary}/{recent_detailed}/{recent_full})"
            )));
        }
        Ok(Self {
            recent_full,
            recent_detailed,
            recent_summary,
        })
    }

    /// Tier for a turn `age` turns old, where `1` is the newest turn.
    #[must_use]
    pub fn tier_for_turn(&self, age: u32) -> MemoryTier {
        if age <= self.recent_full {
            MemoryTier::Full
        } else if age <= self.recent_detailed {
            MemoryTier::Detailed
        } else if age <= self.recent_summary {
            MemoryTier::Summary
        } else {
            MemoryTier::Dropped
        }
    }
}

impl Default for MemoryTierPlan {
    fn default() -> Self {
        tier_plan()
    }
}

/// Whether a session holding `context_tokens` must be rotated.
#[must_use]
pub fn should_rotate(context_tokens: u64) -> bool {
    context_tokens >= ROTATION_THRESHOLD_TOKENS
}

/// The fixed retention plan: 20 full, 50 detailed, 100 summarised.
#[must_use]
pub fn tier_plan() -> MemoryTierPlan {
    MemoryTierPlan {
        recent_full: 20,
        recent_detailed: 50,
        recent_summary: 100,
    }
}

/// Rotation verdict handed back to an agent's runtime adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RotationDecision {
    /// Context size the decision was made for.
    pub context_tokens: u64,
    /// Whether the adapter should start a fresh session.
    pub should_rotate: bool,
    /// Threshold in effect.
    pub threshold_tokens: u64,
    /// Plan to apply when rotating.
    pub plan: MemoryTierPlan,
}

/// Bundle the rotation verdict and plan for `context_tokens`.
#[must_use]
pub fn decide(context_tokens: u64) -> RotationDecision {
    RotationDecision {
        context_tokens,
        should_rotate: should_rotate(context_tokens),
        threshold_tokens: ROTATION_THRESHOLD_TOKENS,
        plan: tier_plan(),
    }
}
