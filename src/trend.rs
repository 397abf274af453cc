//! Period-grouped sales and purchase series for the forecast report.

use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::aggregate::KindLedger;
use crate::registry::BusinessRecord;

/// Bucket width of a trend series.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Grouping {
    Year,
    Quarter,
    #[default]
    Month,
}

/// `YYYY`, `YYYY-Qn` or `YYYY-MM`.
pub fn group_key(date: NaiveDate, grouping: Grouping) -> String {
    match grouping {
        Grouping::Year => format!("{}", date.year()),
        Grouping::Quarter => format!("{}-Q{}", date.year(), date.month0() / 3 + 1),
        Grouping::Month => format!("{}-{:02}", date.year(), date.month()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendReport {
    pub grouping: Grouping,
    /// Sales-order net amount per period. Periods summing to zero are omitted.
    pub sales: BTreeMap<String, f64>,
    /// Purchase-order total per period. Periods summing to zero are omitted.
    pub purchases: BTreeMap<String, f64>,
    /// Sales-order net amount by creator display name, `Unknown` included.
    pub revenue_by_identity: BTreeMap<String, f64>,
    /// Estimations converted into a sales order, by estimation creator.
    pub conversions_by_identity: BTreeMap<String, u64>,
}

/// Builds the trend report from full (undated) ledgers.
///
/// Sales orders are bucketed by their order date, falling back to their
/// creation time; purchase orders by PO date. A sales order converts an
/// estimation when its `estimationId` equals the estimation's `_id`.
pub fn build_trend(
    sales_orders: &KindLedger,
    purchase_orders: &KindLedger,
    estimations: &KindLedger,
    grouping: Grouping,
) -> TrendReport {
    let mut sales = BTreeMap::new();
    let mut revenue_by_identity = BTreeMap::new();
    let mut converted: HashSet<&str> = HashSet::new();

    for entry in sales_orders.entries() {
        let BusinessRecord::SalesOrder(order) = entry.record.as_ref() else {
            continue;
        };
        if let Some(estimation_id) = order.estimation_id.as_deref() {
            converted.insert(estimation_id);
        }

        *revenue_by_identity
            .entry(entry.identity.display_name.clone())
            .or_insert(0.0) += entry.value;

        let Some(at) = order.order_date.or(order.created) else {
            continue;
        };
        *sales
            .entry(group_key(at.date_naive(), grouping))
            .or_insert(0.0) += entry.value;
    }

    let mut purchases = BTreeMap::new();
    for entry in purchase_orders.entries() {
        let Some(at) = entry.record.timestamp() else {
            continue;
        };
        *purchases
            .entry(group_key(at.date_naive(), grouping))
            .or_insert(0.0) += entry.value;
    }

    let mut conversions_by_identity = BTreeMap::new();
    for entry in estimations.entries() {
        let BusinessRecord::Estimation(estimation) = entry.record.as_ref() else {
            continue;
        };
        let is_converted = estimation
            .id
            .as_deref()
            .is_some_and(|id| converted.contains(id));
        if is_converted {
            *conversions_by_identity
                .entry(entry.identity.display_name.clone())
                .or_insert(0) += 1;
        }
    }

    sales.retain(|_, total| *total > 0.0);
    purchases.retain(|_, total| *total > 0.0);

    TrendReport {
        grouping,
        sales,
        purchases,
        revenue_by_identity,
        conversions_by_identity,
    }
}
