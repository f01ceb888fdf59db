use crate::repository::{FactRollup, Ledger, MemberRollup, TestType, TierDefinition};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, instrument};

/// Bucket label for rows whose foreign key does not resolve against the
/// reference collection.
const UNKNOWN_CATEGORY: &str = "Unknown";

/// How far back the "last month" revenue window reaches.
const REVENUE_WINDOW_DAYS: i64 = 30;

/// Number of entries in the top test-type ranking.
const TOP_TESTS_LIMIT: usize = 5;

/// A named count in a dashboard ranking
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryCount {
    pub name: String,
    pub count: u64,
}

/// Read-only dashboard snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct DashboardStats {
    pub users_count: u64,
    pub tests_count: u64,
    pub top_tests: Vec<CategoryCount>,
    pub tier_distribution: Vec<CategoryCount>,
    pub points_earned: f64,
    pub total_profits: f64,
    pub last_month_profits: f64,
}

/// Computes dashboard metrics from independently fetched collections.
///
/// A failed source fetch degrades the dependent sections to zero/empty
/// instead of failing the whole snapshot, so the dashboard always renders.
pub struct StatsService {
    ledger: Arc<dyn Ledger>,
}

impl StatsService {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// Fetch the four source collections concurrently and aggregate them.
    #[instrument(skip(self))]
    pub async fn compute(&self) -> DashboardStats {
        let (members, tiers, facts, types) = futures::join!(
            self.ledger.member_rollups(),
            self.ledger.tiers(),
            self.ledger.fact_rollups(),
            self.ledger.test_types(),
        );

        let members = ok_or_degraded("members", members);
        let tiers = ok_or_degraded("tiers", tiers);
        let facts = ok_or_degraded("facts", facts);
        let types = ok_or_degraded("test_types", types);

        aggregate(
            members.as_deref(),
            tiers.as_deref(),
            facts.as_deref(),
            types.as_deref(),
            Utc::now(),
        )
    }
}

fn ok_or_degraded<T>(collection: &'static str, result: anyhow::Result<Vec<T>>) -> Option<Vec<T>> {
    match result {
        Ok(rows) => Some(rows),
        Err(err) => {
            error!(
                error = %err,
                collection = collection,
                "Dashboard source fetch failed; dependent sections degrade to empty"
            );
            metrics::counter!("loyalty.stats.degraded_sections").increment(1);
            None
        }
    }
}

/// Join the four collections in memory and compute the snapshot.
///
/// No relational join is issued: lookups go through id -> title maps, and
/// rows whose foreign key fails to resolve are bucketed under `Unknown`
/// rather than dropped. `None` stands for a failed fetch of that collection.
pub fn aggregate(
    members: Option<&[MemberRollup]>,
    tiers: Option<&[TierDefinition]>,
    facts: Option<&[FactRollup]>,
    types: Option<&[TestType]>,
    now: DateTime<Utc>,
) -> DashboardStats {
    let mut stats = DashboardStats::default();

    // Tier distribution is pre-seeded from the tier collection, not from
    // observed members, so tiers nobody currently holds still appear with a
    // zero count.
    let mut tier_counts: Vec<CategoryCount> = tiers
        .map(|ts| {
            ts.iter()
                .map(|t| CategoryCount {
                    name: t.title.clone(),
                    count: 0,
                })
                .collect()
        })
        .unwrap_or_default();

    let tier_index: HashMap<i64, usize> = tiers
        .map(|ts| ts.iter().enumerate().map(|(i, t)| (t.id, i)).collect())
        .unwrap_or_default();

    if let Some(members) = members {
        stats.users_count = members.len() as u64;

        let mut unknown_members = 0u64;
        for member in members {
            stats.points_earned += member.points;

            match member.tier_id.and_then(|id| tier_index.get(&id)) {
                Some(&slot) => tier_counts[slot].count += 1,
                None => unknown_members += 1,
            }
        }

        if unknown_members > 0 {
            tier_counts.push(CategoryCount {
                name: UNKNOWN_CATEGORY.to_string(),
                count: unknown_members,
            });
        }
    }

    // Stable sort: tiers with equal counts keep their collection order.
    tier_counts.sort_by(|a, b| b.count.cmp(&a.count));
    stats.tier_distribution = tier_counts;

    if let Some(facts) = facts {
        let type_titles: HashMap<_, _> = types
            .map(|ts| ts.iter().map(|t| (t.id, t.title.as_str())).collect())
            .unwrap_or_default();

        let window_start = now - Duration::days(REVENUE_WINDOW_DAYS);

        // First-seen order is the tie-break for the ranking, so counts live
        // in a Vec in insertion order with a map from title to slot.
        let mut type_counts: Vec<CategoryCount> = Vec::new();
        let mut type_slots: HashMap<String, usize> = HashMap::new();

        for fact in facts {
            stats.tests_count += 1;
            stats.total_profits += fact.cost;

            // Window is inclusive on both ends.
            if fact.created_at >= window_start && fact.created_at <= now {
                stats.last_month_profits += fact.cost;
            }

            let title = type_titles
                .get(&fact.type_id)
                .copied()
                .unwrap_or(UNKNOWN_CATEGORY);

            match type_slots.get(title) {
                Some(&slot) => type_counts[slot].count += 1,
                None => {
                    type_slots.insert(title.to_string(), type_counts.len());
                    type_counts.push(CategoryCount {
                        name: title.to_string(),
                        count: 1,
                    });
                }
            }
        }

        // Stable sort keeps first-seen order between equal counts.
        type_counts.sort_by(|a, b| b.count.cmp(&a.count));
        type_counts.truncate(TOP_TESTS_LIMIT);
        stats.top_tests = type_counts;
    }

    stats
}
