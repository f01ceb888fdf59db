use crate::repository::TierDefinition;

/// Result of applying a test-result cost to a member's points balance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointsOutcome {
    /// Points granted by this ingestion.
    pub points_added: f64,
    /// Balance after the grant.
    pub new_points_total: f64,
}

/// Convert a monetary cost into a points delta using the member's tier.
///
/// `points_added = cost / pcr` when the member has a tier with a positive
/// personal conversion rate. A missing tier or a zero/negative rate grants
/// nothing and leaves the balance unchanged; that is a defined degenerate
/// case, not an error.
pub fn apply_points(
    current_points: f64,
    tier: Option<&TierDefinition>,
    cost: f64,
) -> PointsOutcome {
    let points_added = match tier {
        Some(t) if t.pcr > 0.0 => cost / t.pcr,
        _ => 0.0,
    };

    PointsOutcome {
        points_added,
        new_points_total: current_points + points_added,
    }
}

/// Decide a tier promotion for the given points total.
///
/// Returns the id of the highest tier whose `min_points` threshold the total
/// meets, or `None` when no change is due. Tier ids double as ordinals, and
/// the pipeline never demotes: a target at or below the current tier is a
/// no-op.
pub fn advance_tier(
    tiers: &[TierDefinition],
    current_tier_id: Option<i64>,
    points_total: f64,
) -> Option<i64> {
    let target = tiers
        .iter()
        .filter(|t| t.min_points <= points_total)
        .max_by_key(|t| t.id)?;

    match current_tier_id {
        Some(current) if target.id <= current => None,
        _ => Some(target.id),
    }
}
