//! Static knowledge about the business collections.
//!
//! Each [`CollectionKind`] has a [`CollectionDescriptor`] describing how a
//! document of that kind is recognised (code prefixes), where its status and
//! timestamp live, which field carries its monetary value and whether it
//! takes part in per-identity rankings.

pub mod record;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use record::{BusinessRecord, RecordError};

/// The business document collections the engine aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Opportunities,
    SalesOrders,
    Estimations,
    PurchaseOrders,
    DeliveryOrders,
    SalesInvoices,
    GoodsReceivedNotes,
}

/// Number of collection kinds, used for per-kind counter arrays.
pub const KIND_COUNT: usize = 7;

impl CollectionKind {
    /// Returns the canonical collection name used by the backend.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Opportunities => "opportunities",
            Self::SalesOrders => "salesorders",
            Self::Estimations => "estimations",
            Self::PurchaseOrders => "purchaseorders",
            Self::DeliveryOrders => "deliveryorders",
            Self::SalesInvoices => "salesinvoices",
            Self::GoodsReceivedNotes => "goodsreceivednotes",
        }
    }

    /// Human-readable document name.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Opportunities => "Opportunity",
            Self::SalesOrders => "Sales Order",
            Self::Estimations => "Estimation",
            Self::PurchaseOrders => "Purchase Order",
            Self::DeliveryOrders => "Delivery Order",
            Self::SalesInvoices => "Sales Invoice",
            Self::GoodsReceivedNotes => "GRN",
        }
    }

    /// Parse a canonical collection name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "opportunities" => Some(Self::Opportunities),
            "salesorders" => Some(Self::SalesOrders),
            "estimations" => Some(Self::Estimations),
            "purchaseorders" => Some(Self::PurchaseOrders),
            "deliveryorders" => Some(Self::DeliveryOrders),
            "salesinvoices" => Some(Self::SalesInvoices),
            "goodsreceivednotes" => Some(Self::GoodsReceivedNotes),
            _ => None,
        }
    }

    /// Dense index in `0..KIND_COUNT`.
    pub const fn index(self) -> usize {
        match self {
            Self::Opportunities => 0,
            Self::SalesOrders => 1,
            Self::Estimations => 2,
            Self::PurchaseOrders => 3,
            Self::DeliveryOrders => 4,
            Self::SalesInvoices => 5,
            Self::GoodsReceivedNotes => 6,
        }
    }

    /// Returns all collection kinds in registry order.
    pub fn all() -> &'static [Self] {
        &[
            Self::Opportunities,
            Self::SalesOrders,
            Self::Estimations,
            Self::PurchaseOrders,
            Self::DeliveryOrders,
            Self::SalesInvoices,
            Self::GoodsReceivedNotes,
        ]
    }

    /// Kinds whose documents go through an approval workflow.
    pub const fn has_approvals(self) -> bool {
        matches!(
            self,
            Self::SalesOrders | Self::PurchaseOrders | Self::GoodsReceivedNotes
        )
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalised document status bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Open,
    Closed,
    Cancelled,
}

impl Status {
    /// Case-insensitive, whitespace-tolerant status parse. Statuses outside
    /// the three buckets (e.g. "Draft") yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Whether a raw status marks a sales order whose delivery order was raised.
pub fn is_do_created(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case("do created")
}

/// Static description of one collection kind.
#[derive(Debug)]
pub struct CollectionDescriptor {
    pub kind: CollectionKind,
    /// Field carrying the human-readable document code.
    pub code_field: &'static str,
    /// A record belongs to this kind only if its code starts with one of these.
    pub code_prefixes: &'static [&'static str],
    pub status_field: &'static str,
    pub timestamp_field: &'static str,
    /// Dotted path of the monetary value (documentation and diagnostics).
    pub value_path: &'static str,
    /// Whether per-identity rankings are produced for this kind.
    pub rankable: bool,
}

impl CollectionDescriptor {
    /// Case-sensitive prefix test against this kind's code prefixes.
    pub fn matches_code(&self, code: &str) -> bool {
        self.code_prefixes.iter().any(|prefix| code.starts_with(prefix))
    }
}

const OPPORTUNITIES: CollectionDescriptor = CollectionDescriptor {
    kind: CollectionKind::Opportunities,
    code_field: "opportunityCode",
    code_prefixes: &["OPIT"],
    status_field: "status",
    timestamp_field: "created",
    value_path: "selling - cost",
    rankable: false,
};

const SALES_ORDERS: CollectionDescriptor = CollectionDescriptor {
    kind: CollectionKind::SalesOrders,
    code_field: "salesOrderCode",
    code_prefixes: &["SOIT"],
    status_field: "status",
    timestamp_field: "created",
    value_path: "accountDetailsTable.totalCalculation.netAmount",
    rankable: true,
};

const ESTIMATIONS: CollectionDescriptor = CollectionDescriptor {
    kind: CollectionKind::Estimations,
    code_field: "estimationCode",
    code_prefixes: &["PEIT", "BDIT"],
    status_field: "status",
    timestamp_field: "created",
    value_path: "accountDetailsTable.currentTotal",
    rankable: true,
};

const PURCHASE_ORDERS: CollectionDescriptor = CollectionDescriptor {
    kind: CollectionKind::PurchaseOrders,
    code_field: "POCode",
    code_prefixes: &["POIT"],
    status_field: "POStatus",
    timestamp_field: "PODate",
    value_path: "accountDetailsTable.currentTotal",
    rankable: true,
};

const DELIVERY_ORDERS: CollectionDescriptor = CollectionDescriptor {
    kind: CollectionKind::DeliveryOrders,
    code_field: "DOCode",
    code_prefixes: &["DNIT"],
    status_field: "status",
    timestamp_field: "created",
    value_path: "details[0].netAmount",
    rankable: true,
};

const SALES_INVOICES: CollectionDescriptor = CollectionDescriptor {
    kind: CollectionKind::SalesInvoices,
    code_field: "SICode",
    code_prefixes: &["SIIT"],
    status_field: "status",
    timestamp_field: "created",
    value_path: "totalNetAmount",
    rankable: true,
};

const GOODS_RECEIVED_NOTES: CollectionDescriptor = CollectionDescriptor {
    kind: CollectionKind::GoodsReceivedNotes,
    code_field: "GRNCode",
    code_prefixes: &["GRIT"],
    status_field: "status",
    timestamp_field: "created",
    value_path: "accountDetailsTable.currentTotal",
    rankable: true,
};

/// Returns the descriptor for a kind.
pub fn descriptor(kind: CollectionKind) -> &'static CollectionDescriptor {
    match kind {
        CollectionKind::Opportunities => &OPPORTUNITIES,
        CollectionKind::SalesOrders => &SALES_ORDERS,
        CollectionKind::Estimations => &ESTIMATIONS,
        CollectionKind::PurchaseOrders => &PURCHASE_ORDERS,
        CollectionKind::DeliveryOrders => &DELIVERY_ORDERS,
        CollectionKind::SalesInvoices => &SALES_INVOICES,
        CollectionKind::GoodsReceivedNotes => &GOODS_RECEIVED_NOTES,
    }
}

/// Returns the kind of a decoded record if its code carries one of that
/// kind's prefixes, `None` otherwise.
pub fn match_kind(record: &BusinessRecord) -> Option<CollectionKind> {
    let desc = descriptor(record.kind());
    desc.matches_code(record.code()).then_some(desc.kind)
}

/// Finds the kind whose prefixes match a bare document code.
pub fn kind_for_code(code: &str) -> Option<CollectionKind> {
    CollectionKind::all()
        .iter()
        .map(|&kind| descriptor(kind))
        .find(|desc| desc.matches_code(code))
        .map(|desc| desc.kind)
}

/// Monetary value of a record as seen by `kind`. Absent or unparseable
/// amounts read as zero, as does a record of a different kind.
pub fn extract_value(record: &BusinessRecord, kind: CollectionKind) -> f64 {
    if record.kind() != kind {
        return 0.0;
    }
    record.amount()
}

/// Normalised status of a record as seen by `kind`.
pub fn status_of(record: &BusinessRecord, kind: CollectionKind) -> Option<Status> {
    if record.kind() != kind {
        return None;
    }
    record.status_text().and_then(Status::parse)
}
