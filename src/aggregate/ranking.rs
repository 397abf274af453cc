use serde::Serialize;

use crate::identity::Identity;

/// Running count and value for one identity within one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Accumulator {
    pub count: u64,
    pub total_value: f64,
}

impl Accumulator {
    pub fn record(&mut self, value: f64) {
        self.count += 1;
        self.total_value += value;
    }
}

/// One row of a per-kind leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankingEntry {
    pub identity: Identity,
    pub value: f64,
    pub count: u64,
    /// Share of the kind's record count, two decimals.
    pub percentage: String,
}

/// Formats `count / total * 100` with two decimals, `"0.00"` for an empty total.
pub fn percentage(count: u64, total: u64) -> String {
    if total == 0 {
        return "0.00".to_string();
    }
    format!("{:.2}", count as f64 / total as f64 * 100.0)
}

/// Builds a leaderboard sorted by value, then count (both descending), then
/// display name. The `Unknown` sentinel never ranks.
pub fn generate_rankings<I>(accumulators: I, total_count: u64) -> Vec<RankingEntry>
where
    I: IntoIterator<Item = (Identity, Accumulator)>,
{
    let mut entries: Vec<RankingEntry> = accumulators
        .into_iter()
        .filter(|(identity, _)| !identity.is_unknown())
        .map(|(identity, acc)| RankingEntry {
            identity,
            value: acc.total_value,
            count: acc.count,
            percentage: percentage(acc.count, total_count),
        })
        .collect();

    entries.sort_by(|a, b| {
        b.value
            .total_cmp(&a.value)
            .then_with(|| b.count.cmp(&a.count))
            .then_with(|| a.identity.display_name.cmp(&b.identity.display_name))
    });
    entries
}
