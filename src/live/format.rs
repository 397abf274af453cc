//! Human-readable log lines for activity and approval feeds.

use chrono::{DateTime, FixedOffset, Utc};

use crate::identity::{Identity, IdentityDirectory};
use crate::registry::BusinessRecord;

const MISSING: &str = "N/A";

/// Formats an amount with thousands separators and at most three fractional
/// digits, e.g. `1234567.5` as `1,234,567.5`.
pub fn format_amount(value: f64) -> String {
    let rounded = (value * 1000.0).round() / 1000.0;
    let negative = rounded < 0.0;
    let fixed = format!("{:.3}", rounded.abs());
    let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), ""));
    let frac_part = frac_part.trim_end_matches('0');

    let mut out = String::with_capacity(fixed.len() + int_part.len() / 3 + 1);
    if negative {
        out.push('-');
    }
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    if !frac_part.is_empty() {
        out.push('.');
        out.push_str(frac_part);
    }
    out
}

/// Formats a timestamp in the business timezone as `Mar 1, 2024, 10:00:00 AM`.
pub fn format_timestamp(ts: DateTime<Utc>, offset: FixedOffset) -> String {
    ts.with_timezone(&offset)
        .format("%b %-d, %Y, %-I:%M:%S %p")
        .to_string()
}

fn or_missing(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or(MISSING)
}

/// Activity line describing what `creator` did with `record`.
pub fn format_activity(
    record: &BusinessRecord,
    creator: &Identity,
    offset: FixedOffset,
) -> String {
    let name = &creator.display_name;
    let amount = format_amount(record.amount());
    let status = or_missing(record.status_text());
    let code = record.code();

    match record {
        BusinessRecord::SalesOrder(so) => format!(
            "{name} made a Sales Order: {code} of type: {} For {} with a net amount: {amount}, Sales Order is now {status}",
            or_missing(so.order_type.as_deref()),
            or_missing(so.customer_name.as_deref()),
        ),
        BusinessRecord::Estimation(_) => format!(
            "{name} made an estimation: {code} worth {amount}, estimation is now {status}"
        ),
        BusinessRecord::PurchaseOrder(po) => format!(
            "{name} made a Purchase Order: {code} worth {amount} to {}, Purchase Order is now {status}",
            or_missing(po.supplier_name.as_deref()),
        ),
        BusinessRecord::DeliveryOrder(_) => format!(
            "{name} made a Delivery Order: {code} worth {amount}, Delivery Order is now {status}"
        ),
        BusinessRecord::GoodsReceivedNote(_) => {
            format!("{name} made a GRN: {code} of {amount}, GRN is now {status}")
        }
        BusinessRecord::SalesInvoice(_) => format!(
            "{name} made a Sales Invoice: {code} of {amount}, Sales Invoice is now {status}"
        ),
        BusinessRecord::Opportunity(_) => {
            let at = record
                .timestamp()
                .map(|ts| format_timestamp(ts, offset))
                .unwrap_or_else(|| "Unknown Time".to_string());
            format!("{name} performed an action at {at}.")
        }
    }
}

/// Approval line for a record, or `None` while it is still pending.
///
/// Only the first six approval steps are inspected for a rejection.
pub fn format_approval(
    record: &BusinessRecord,
    creator: &Identity,
    directory: &IdentityDirectory,
) -> Option<String> {
    let approval = record.approval()?;
    let code = record.code();

    if approval.status.as_deref() == Some("Approved") {
        return Some(format!("{code} got approved."));
    }

    let rejected = approval
        .details
        .as_deref()
        .unwrap_or_default()
        .iter()
        .take(6)
        .find(|step| step.status.as_deref() == Some("Rejected"))?;

    let rejector = directory.resolve(rejected.user_id.as_deref());
    Some(format!(
        "{rejector} rejected the document {code} created by {creator}\nReason: {}",
        or_missing(rejected.remarks.as_deref()),
    ))
}
