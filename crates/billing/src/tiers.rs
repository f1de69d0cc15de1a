//! SKU-prefix side effects
//!
//! Some subscription tiers carry account-level side effects beyond the
//! subscription row itself. They are listed here by SKU prefix instead of
//! being special-cased per SKU in the reconciliation code.

use crate::sku::canonical_sku;

/// Account-level change applied when a tier becomes active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierEffect {
    /// Drop the user's pending range-tracking row
    ClearPendingRangeTracking,
    /// Set a user meta flag to "true"
    SetUserMeta(&'static str),
    /// Remove a user meta flag
    ClearUserMeta(&'static str),
    /// Turn project tracking back on for the user
    EnableProjectTracking,
}

/// Session tiers: new or re-enabled pro subscriptions
const PRO_SESSION_EFFECTS: &[TierEffect] = &[
    TierEffect::ClearPendingRangeTracking,
    TierEffect::SetUserMeta("pro_session_member"),
    TierEffect::ClearUserMeta("pro_session_lapsed"),
    TierEffect::EnableProjectTracking,
];

const TIER_EFFECTS: &[(&str, &[TierEffect])] = &[("pro_", PRO_SESSION_EFFECTS)];

/// Effects for a subscription SKU, empty when no prefix matches
pub fn effects_for_sku(sku: &str) -> &'static [TierEffect] {
    let sku = canonical_sku(sku);
    TIER_EFFECTS
        .iter()
        .find(|(prefix, _)| sku.starts_with(prefix))
        .map(|(_, effects)| *effects)
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pro_prefix_matches_any_case() {
        assert_eq!(effects_for_sku("pro_monthly").len(), 4);
        assert_eq!(effects_for_sku("PRO_annual"), PRO_SESSION_EFFECTS);
    }

    #[test]
    fn test_other_skus_have_no_effects() {
        assert!(effects_for_sku("basic_monthly").is_empty());
        assert!(effects_for_sku("professional").is_empty());
    }
}
