//! Typed business records decoded from the loosely shaped JSON documents
//! served by the backend.
//!
//! Every collection kind has its own struct. Monetary fields accept numbers
//! or numeric strings, timestamps accept RFC 3339, naive ISO strings or epoch
//! milliseconds, and nested sub-documents of an unexpected shape read as
//! absent. The only hard requirement is a string document code.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::{descriptor, CollectionKind};

/// Errors produced while decoding a business record.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("{kind} record has no string {field}")]
    MissingCode {
        kind: CollectionKind,
        field: &'static str,
    },

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("live message has no collection field")]
    MissingCollection,

    #[error("decoding record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Monetary amount serialised as either a JSON number or a numeric string.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Amount(pub f64);

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self(parse_amount(&value).unwrap_or(0.0)))
    }
}

/// Parses a number or a numeric string. Non-finite values are rejected.
pub fn parse_amount(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Parses the timestamp shapes seen in backend documents.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        // MongoDB extended JSON: {"$date": ...}
        Value::Object(map) => map.get("$date").and_then(parse_timestamp),
        _ => None,
    }
}

fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(parse_timestamp))
}

/// Document ids arrive as plain strings or as `{"$oid": "..."}`.
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Object(map)) => map
            .get("$oid")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountDetails {
    #[serde(rename = "currentTotal", default)]
    pub current_total: Option<Amount>,
    #[serde(rename = "totalCalculation", default, deserialize_with = "lenient")]
    pub total_calculation: Option<TotalCalculation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TotalCalculation {
    #[serde(rename = "netAmount", default)]
    pub net_amount: Option<Amount>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LineDetail {
    #[serde(rename = "netAmount", default)]
    pub net_amount: Option<Amount>,
}

/// Approval workflow state attached to orders and GRNs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApprovalInfo {
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub details: Option<Vec<ApprovalStep>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApprovalStep {
    #[serde(rename = "userId", default, deserialize_with = "lenient")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Opportunity {
    #[serde(rename = "opportunityCode")]
    pub code: String,
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<String>,
    #[serde(rename = "createdBy", default, deserialize_with = "lenient")]
    pub created_by: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub selling: Option<Amount>,
    #[serde(default)]
    pub cost: Option<Amount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SalesOrder {
    #[serde(rename = "_id", default, deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(rename = "salesOrderCode")]
    pub code: String,
    #[serde(rename = "salesOrderType", default, deserialize_with = "lenient")]
    pub order_type: Option<String>,
    #[serde(rename = "customerName", default, deserialize_with = "lenient")]
    pub customer_name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<String>,
    #[serde(rename = "createdBy", default, deserialize_with = "lenient")]
    pub created_by: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created: Option<DateTime<Utc>>,
    #[serde(rename = "salesOrderDate", default, deserialize_with = "lenient_timestamp")]
    pub order_date: Option<DateTime<Utc>>,
    #[serde(rename = "estimationId", default, deserialize_with = "lenient_id")]
    pub estimation_id: Option<String>,
    #[serde(rename = "accountDetailsTable", default, deserialize_with = "lenient")]
    pub account_details: Option<AccountDetails>,
    #[serde(rename = "netAmount", default)]
    pub net_amount: Option<Amount>,
    #[serde(rename = "approvalInfo", default, deserialize_with = "lenient")]
    pub approval: Option<ApprovalInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Estimation {
    #[serde(rename = "_id", default, deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(rename = "estimationCode")]
    pub code: String,
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<String>,
    #[serde(rename = "createdBy", default, deserialize_with = "lenient")]
    pub created_by: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created: Option<DateTime<Utc>>,
    #[serde(rename = "accountDetailsTable", default, deserialize_with = "lenient")]
    pub account_details: Option<AccountDetails>,
    #[serde(rename = "currentTotal", default)]
    pub current_total: Option<Amount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PurchaseOrder {
    #[serde(rename = "POCode")]
    pub code: String,
    #[serde(rename = "POStatus", default, deserialize_with = "lenient")]
    pub status: Option<String>,
    #[serde(rename = "supplierName", default, deserialize_with = "lenient")]
    pub supplier_name: Option<String>,
    #[serde(rename = "createdBy", default, deserialize_with = "lenient")]
    pub created_by: Option<String>,
    #[serde(rename = "PODate", default, deserialize_with = "lenient_timestamp")]
    pub po_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created: Option<DateTime<Utc>>,
    #[serde(rename = "accountDetailsTable", default, deserialize_with = "lenient")]
    pub account_details: Option<AccountDetails>,
    #[serde(rename = "currentTotal", default)]
    pub current_total: Option<Amount>,
    #[serde(rename = "approvalInfo", default, deserialize_with = "lenient")]
    pub approval: Option<ApprovalInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryOrder {
    #[serde(rename = "DOCode")]
    pub code: String,
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<String>,
    #[serde(rename = "createdBy", default, deserialize_with = "lenient")]
    pub created_by: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient")]
    pub details: Option<Vec<LineDetail>>,
    #[serde(rename = "netAmount", default)]
    pub net_amount: Option<Amount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SalesInvoice {
    #[serde(rename = "SICode")]
    pub code: String,
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<String>,
    #[serde(rename = "createdBy", default, deserialize_with = "lenient")]
    pub created_by: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created: Option<DateTime<Utc>>,
    #[serde(rename = "totalNetAmount", default)]
    pub total_net_amount: Option<Amount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoodsReceivedNote {
    #[serde(rename = "GRNCode")]
    pub code: String,
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<String>,
    #[serde(rename = "createdBy", default, deserialize_with = "lenient")]
    pub created_by: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created: Option<DateTime<Utc>>,
    #[serde(rename = "accountDetailsTable", default, deserialize_with = "lenient")]
    pub account_details: Option<AccountDetails>,
    #[serde(rename = "currentTotal", default)]
    pub current_total: Option<Amount>,
    #[serde(rename = "approvalInfo", default, deserialize_with = "lenient")]
    pub approval: Option<ApprovalInfo>,
}

/// One business document, tagged by its collection kind.
#[derive(Debug, Clone)]
pub enum BusinessRecord {
    Opportunity(Opportunity),
    SalesOrder(SalesOrder),
    Estimation(Estimation),
    PurchaseOrder(PurchaseOrder),
    DeliveryOrder(DeliveryOrder),
    SalesInvoice(SalesInvoice),
    GoodsReceivedNote(GoodsReceivedNote),
}

/// Applies the same expression to whichever variant a record holds.
macro_rules! each_record {
    ($record:expr, $inner:ident => $body:expr) => {
        match $record {
            BusinessRecord::Opportunity($inner) => $body,
            BusinessRecord::SalesOrder($inner) => $body,
            BusinessRecord::Estimation($inner) => $body,
            BusinessRecord::PurchaseOrder($inner) => $body,
            BusinessRecord::DeliveryOrder($inner) => $body,
            BusinessRecord::SalesInvoice($inner) => $body,
            BusinessRecord::GoodsReceivedNote($inner) => $body,
        }
    };
}

fn amount(value: Option<Amount>) -> Option<f64> {
    value.map(|a| a.0)
}

fn account_total(details: &Option<AccountDetails>) -> Option<f64> {
    details.as_ref().and_then(|d| amount(d.current_total))
}

impl BusinessRecord {
    /// Decodes a raw document as a record of `kind`.
    pub fn from_value(kind: CollectionKind, value: Value) -> Result<Self, RecordError> {
        let code_field = descriptor(kind).code_field;
        let Value::Object(map) = &value else {
            return Err(RecordError::NotAnObject);
        };
        if !map.get(code_field).is_some_and(Value::is_string) {
            return Err(RecordError::MissingCode {
                kind,
                field: code_field,
            });
        }

        let record = match kind {
            CollectionKind::Opportunities => Self::Opportunity(serde_json::from_value(value)?),
            CollectionKind::SalesOrders => Self::SalesOrder(serde_json::from_value(value)?),
            CollectionKind::Estimations => Self::Estimation(serde_json::from_value(value)?),
            CollectionKind::PurchaseOrders => Self::PurchaseOrder(serde_json::from_value(value)?),
            CollectionKind::DeliveryOrders => Self::DeliveryOrder(serde_json::from_value(value)?),
            CollectionKind::SalesInvoices => Self::SalesInvoice(serde_json::from_value(value)?),
            CollectionKind::GoodsReceivedNotes => {
                Self::GoodsReceivedNote(serde_json::from_value(value)?)
            }
        };
        Ok(record)
    }

    pub fn kind(&self) -> CollectionKind {
        match self {
            Self::Opportunity(_) => CollectionKind::Opportunities,
            Self::SalesOrder(_) => CollectionKind::SalesOrders,
            Self::Estimation(_) => CollectionKind::Estimations,
            Self::PurchaseOrder(_) => CollectionKind::PurchaseOrders,
            Self::DeliveryOrder(_) => CollectionKind::DeliveryOrders,
            Self::SalesInvoice(_) => CollectionKind::SalesInvoices,
            Self::GoodsReceivedNote(_) => CollectionKind::GoodsReceivedNotes,
        }
    }

    pub fn code(&self) -> &str {
        each_record!(self, r => r.code.as_str())
    }

    pub fn status_text(&self) -> Option<&str> {
        each_record!(self, r => r.status.as_deref())
    }

    /// Raw creator id, if present.
    pub fn created_by(&self) -> Option<&str> {
        each_record!(self, r => r.created_by.as_deref())
    }

    /// Event time of the record. Purchase orders use `PODate`, falling back
    /// to `created`.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::PurchaseOrder(po) => po.po_date.or(po.created),
            other => each_record!(other, r => r.created),
        }
    }

    /// Monetary value of the record. Nested paths are tried first, then the
    /// flat field of the same name. Opportunities yield `selling - cost`.
    pub fn amount(&self) -> f64 {
        let value = match self {
            Self::Opportunity(op) => {
                return amount(op.selling).unwrap_or(0.0) - amount(op.cost).unwrap_or(0.0)
            }
            Self::SalesOrder(so) => so
                .account_details
                .as_ref()
                .and_then(|d| d.total_calculation.as_ref())
                .and_then(|t| amount(t.net_amount))
                .or(amount(so.net_amount)),
            Self::Estimation(est) => {
                account_total(&est.account_details).or(amount(est.current_total))
            }
            Self::PurchaseOrder(po) => {
                account_total(&po.account_details).or(amount(po.current_total))
            }
            Self::DeliveryOrder(d) => d
                .details
                .as_ref()
                .and_then(|lines| lines.first())
                .and_then(|line| amount(line.net_amount))
                .or(amount(d.net_amount)),
            Self::SalesInvoice(si) => amount(si.total_net_amount),
            Self::GoodsReceivedNote(grn) => {
                account_total(&grn.account_details).or(amount(grn.current_total))
            }
        };
        value.unwrap_or(0.0)
    }

    /// Approval workflow state for kinds that carry one.
    pub fn approval(&self) -> Option<&ApprovalInfo> {
        match self {
            Self::SalesOrder(so) => so.approval.as_ref(),
            Self::PurchaseOrder(po) => po.approval.as_ref(),
            Self::GoodsReceivedNote(grn) => grn.approval.as_ref(),
            _ => None,
        }
    }
}
