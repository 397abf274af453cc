//! Push-channel events and the per-view log feeds they update.
//!
//! A [`Feed`] keeps, per collection kind, a newest-first list of log entries
//! plus a pointer to the newest entry across all kinds. Absorbing an entry
//! for a code already present replaces it, and the pointer is recomputed from
//! the list heads, so absorbing the same event twice changes nothing and
//! out-of-order arrivals still leave the newest event on top.

pub mod format;
pub mod ws;

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::identity::{Identity, IdentityDirectory};
use crate::registry::{BusinessRecord, CollectionKind, RecordError};

pub use format::{format_activity, format_amount, format_approval, format_timestamp};

/// Shown when a feed holds no entries.
pub const NO_LOGS: &str = "No logs available.";

/// Which feed a live event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveChannel {
    Activity,
    Approval,
}

impl LiveChannel {
    /// Maps the push-channel event name; anything but `newApprovalLog` is
    /// activity.
    pub fn from_event_name(name: Option<&str>) -> Self {
        match name {
            Some("newApprovalLog") => Self::Approval,
            _ => Self::Activity,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Activity => "activity",
            Self::Approval => "approval",
        }
    }
}

/// A single pushed record.
#[derive(Debug, Clone)]
pub struct LiveEvent {
    pub channel: LiveChannel,
    pub record: BusinessRecord,
    pub received_at: DateTime<Utc>,
}

impl LiveEvent {
    pub fn kind(&self) -> CollectionKind {
        self.record.kind()
    }

    /// Decodes a push-channel text frame.
    ///
    /// Accepted shapes are `{"event": ..., "log": {"collection": ..., ...}}`
    /// and the bare record `{"collection": ..., ...}` with an optional
    /// `event` field.
    pub fn from_message(text: &str, received_at: DateTime<Utc>) -> Result<Self, RecordError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut envelope) = value else {
            return Err(RecordError::NotAnObject);
        };

        let channel =
            LiveChannel::from_event_name(envelope.get("event").and_then(Value::as_str));
        let mut payload = match envelope.remove("log") {
            Some(Value::Object(log)) => log,
            Some(_) => return Err(RecordError::NotAnObject),
            None => envelope,
        };

        let kind = match payload.remove("collection") {
            Some(Value::String(name)) => {
                CollectionKind::from_name(&name).ok_or(RecordError::UnknownCollection(name))?
            }
            _ => return Err(RecordError::MissingCollection),
        };

        Ok(Self {
            channel,
            record: BusinessRecord::from_value(kind, Value::Object(payload))?,
            received_at,
        })
    }
}

/// One rendered log line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub kind: CollectionKind,
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub created_by: Identity,
}

impl LogEntry {
    fn order_key(&self) -> (DateTime<Utc>, CollectionKind, &str) {
        (self.timestamp, self.kind, self.code.as_str())
    }

    /// `"<timestamp>: <message>"` with the timestamp in `offset`.
    pub fn display_line(&self, offset: FixedOffset) -> String {
        format!("{}: {}", format_timestamp(self.timestamp, offset), self.message)
    }
}

fn passes_filter(creator: &Identity, filter: Option<&Identity>) -> bool {
    filter.map_or(true, |f| f.id == creator.id)
}

/// Activity entry for a record. Records without a timestamp, from creators
/// missing in the directory, or outside the identity filter produce none.
pub fn activity_entry(
    record: &BusinessRecord,
    directory: &IdentityDirectory,
    filter: Option<&Identity>,
    offset: FixedOffset,
) -> Option<LogEntry> {
    let timestamp = record.timestamp()?;
    let creator = directory.resolve(record.created_by());
    if creator.is_unknown() || !passes_filter(&creator, filter) {
        return None;
    }
    Some(LogEntry {
        kind: record.kind(),
        code: record.code().to_string(),
        message: format_activity(record, &creator, offset),
        timestamp,
        created_by: creator,
    })
}

/// Approval entry for a record, if it has been approved or rejected.
pub fn approval_entry(
    record: &BusinessRecord,
    directory: &IdentityDirectory,
    filter: Option<&Identity>,
) -> Option<LogEntry> {
    if !record.kind().has_approvals() {
        return None;
    }
    let timestamp = record.timestamp()?;
    let creator = directory.resolve(record.created_by());
    if !passes_filter(&creator, filter) {
        return None;
    }
    let message = format_approval(record, &creator, directory)?;
    Some(LogEntry {
        kind: record.kind(),
        code: record.code().to_string(),
        message,
        timestamp,
        created_by: creator,
    })
}

/// Newest-first log lists per kind with a cross-kind latest pointer.
/// Display lines render in the feed's business timezone.
#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    channel: LiveChannel,
    limit: usize,
    offset: FixedOffset,
    logs: BTreeMap<CollectionKind, Vec<LogEntry>>,
    latest: Option<LogEntry>,
}

impl Feed {
    pub fn new(channel: LiveChannel, limit: usize, offset: FixedOffset) -> Self {
        Self {
            channel,
            limit: limit.max(1),
            offset,
            logs: BTreeMap::new(),
            latest: None,
        }
    }

    /// Builds a feed from a full cycle's entries.
    pub fn from_entries(
        channel: LiveChannel,
        limit: usize,
        offset: FixedOffset,
        entries: impl IntoIterator<Item = LogEntry>,
    ) -> Self {
        let mut feed = Self::new(channel, limit, offset);
        for entry in entries {
            feed.logs.entry(entry.kind).or_default().push(entry);
        }
        for list in feed.logs.values_mut() {
            list.sort_by(|a, b| b.order_key().cmp(&a.order_key()));
            list.dedup_by(|a, b| a.code == b.code && a.timestamp == b.timestamp);
            list.truncate(feed.limit);
        }
        feed.recompute_latest();
        feed
    }

    /// Inserts or replaces the entry for its code. Returns whether the
    /// latest pointer changed.
    pub fn absorb(&mut self, entry: LogEntry) -> bool {
        let list = self.logs.entry(entry.kind).or_default();
        list.retain(|existing| existing.code != entry.code);
        let pos = list.partition_point(|existing| existing.order_key() > entry.order_key());
        list.insert(pos, entry);
        list.truncate(self.limit);

        let before = self.latest.clone();
        self.recompute_latest();
        before != self.latest
    }

    fn recompute_latest(&mut self) {
        self.latest = self
            .logs
            .values()
            .filter_map(|list| list.first())
            .max_by(|a, b| a.order_key().cmp(&b.order_key()))
            .cloned();
    }

    pub fn channel(&self) -> LiveChannel {
        self.channel
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn logs(&self, kind: CollectionKind) -> &[LogEntry] {
        self.logs.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn latest(&self) -> Option<&LogEntry> {
        self.latest.as_ref()
    }

    /// Display line of the newest entry, or [`NO_LOGS`].
    pub fn latest_message(&self) -> String {
        self.latest
            .as_ref()
            .map(|entry| entry.display_line(self.offset))
            .unwrap_or_else(|| NO_LOGS.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).expect("offset")
    }

    fn at(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, min, 0).single().expect("ts")
    }

    fn entry(kind: CollectionKind, code: &str, ts: DateTime<Utc>) -> LogEntry {
        LogEntry {
            kind,
            code: code.to_string(),
            message: format!("{code} happened"),
            timestamp: ts,
            created_by: Identity::new("A", "Alice"),
        }
    }

    #[test]
    fn test_out_of_order_absorb_keeps_newest_latest() {
        let mut feed = Feed::new(LiveChannel::Activity, 50, utc());
        assert_eq!(feed.latest_message(), NO_LOGS);

        assert!(feed.absorb(entry(CollectionKind::SalesOrders, "SOIT1", at(10, 5))));
        assert!(!feed.absorb(entry(CollectionKind::PurchaseOrders, "POIT1", at(10, 3))));

        let latest = feed.latest().expect("latest");
        assert_eq!(latest.code, "SOIT1");
        assert_eq!(
            feed.latest_message(),
            "Mar 1, 2024, 10:05:00 AM: SOIT1 happened"
        );
    }

    #[test]
    fn test_latest_message_uses_business_offset() {
        let cairo = FixedOffset::east_opt(2 * 3600).expect("offset");
        let mut feed = Feed::new(LiveChannel::Activity, 50, cairo);
        feed.absorb(entry(CollectionKind::SalesOrders, "SOIT1", at(23, 30)));
        assert_eq!(
            feed.latest_message(),
            "Mar 2, 2024, 1:30:00 AM: SOIT1 happened"
        );
    }

    #[test]
    fn test_absorb_is_idempotent() {
        let mut feed = Feed::new(LiveChannel::Activity, 50, utc());
        feed.absorb(entry(CollectionKind::SalesOrders, "SOIT1", at(9, 0)));
        feed.absorb(entry(CollectionKind::SalesOrders, "SOIT2", at(11, 0)));
        let once = feed.clone();

        assert!(!feed.absorb(entry(CollectionKind::SalesOrders, "SOIT2", at(11, 0))));
        assert_eq!(feed, once);
        assert_eq!(feed.logs(CollectionKind::SalesOrders).len(), 2);
        assert_eq!(feed.logs(CollectionKind::SalesOrders)[0].code, "SOIT2");
    }

    #[test]
    fn test_logs_stay_newest_first_and_bounded() {
        let mut feed = Feed::new(LiveChannel::Activity, 2, utc());
        feed.absorb(entry(CollectionKind::Estimations, "PEIT1", at(9, 0)));
        feed.absorb(entry(CollectionKind::Estimations, "PEIT3", at(11, 0)));
        feed.absorb(entry(CollectionKind::Estimations, "PEIT2", at(10, 0)));

        let codes: Vec<&str> = feed
            .logs(CollectionKind::Estimations)
            .iter()
            .map(|e| e.code.as_str())
            .collect();
        assert_eq!(codes, vec!["PEIT3", "PEIT2"]);
        assert!(feed.logs(CollectionKind::SalesInvoices).is_empty());
    }

    #[test]
    fn test_latest_tie_is_deterministic() {
        let a = entry(CollectionKind::SalesOrders, "SOIT1", at(10, 0));
        let b = entry(CollectionKind::PurchaseOrders, "POIT1", at(10, 0));

        let one = Feed::from_entries(
            LiveChannel::Activity,
            10,
            utc(),
            vec![a.clone(), b.clone()],
        );
        let two = Feed::from_entries(LiveChannel::Activity, 10, utc(), vec![b, a]);
        assert_eq!(one.latest(), two.latest());
    }

    #[test]
    fn test_from_message_shapes() {
        let now = at(12, 0);
        let bare = LiveEvent::from_message(
            r#"{"collection": "purchaseorders", "POCode": "POIT9", "POStatus": "Open"}"#,
            now,
        )
        .expect("bare record");
        assert_eq!(bare.kind(), CollectionKind::PurchaseOrders);
        assert_eq!(bare.channel, LiveChannel::Activity);

        let wrapped = LiveEvent::from_message(
            &json!({
                "event": "newApprovalLog",
                "log": {"collection": "goodsreceivednotes", "GRNCode": "GRIT1"}
            })
            .to_string(),
            now,
        )
        .expect("wrapped record");
        assert_eq!(wrapped.channel, LiveChannel::Approval);
        assert_eq!(wrapped.record.code(), "GRIT1");

        let err = LiveEvent::from_message(r#"{"collection": "invoices", "x": 1}"#, now)
            .expect_err("unknown collection");
        assert!(err.to_string().contains("invoices"));

        let err = LiveEvent::from_message(r#"{"POCode": "POIT1"}"#, now)
            .expect_err("missing collection");
        assert!(matches!(err, RecordError::MissingCollection));
    }

    #[test]
    fn test_activity_entry_requires_known_creator() {
        let dir = IdentityDirectory::new([("A".to_string(), "Alice".to_string())]);
        let known = BusinessRecord::from_value(
            CollectionKind::Estimations,
            json!({"estimationCode": "PEIT1", "createdBy": "A", "created": "2024-03-01T10:00:00Z"}),
        )
        .expect("record");
        let ghost = BusinessRecord::from_value(
            CollectionKind::Estimations,
            json!({"estimationCode": "PEIT2", "createdBy": "Z", "created": "2024-03-01T10:00:00Z"}),
        )
        .expect("record");

        assert!(activity_entry(&known, &dir, None, utc()).is_some());
        assert!(activity_entry(&ghost, &dir, None, utc()).is_none());
        let bob = Identity::new("B", "Bob");
        assert!(activity_entry(&known, &dir, Some(&bob), utc()).is_none());
    }
}
