use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata key that overrides the billed unit of a product.
pub const USAGE_UNIT_KEY: &str = "usage.unit";

/// key: usage-models -> raw metering sample (read-only, owned by metering)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeteringRecord {
    pub id: i64,
    pub transaction_id: String,
    pub resource_id: String,
    pub cloud_account_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub reported: bool,
}

/// Unreported samples of one resource, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMeteringRecords {
    pub resource_id: String,
    pub cloud_account_id: String,
    #[serde(default)]
    pub resource_name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub metering_records: Vec<MeteringRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductFamily {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vendor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub families: Vec<ProductFamily>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountType {
    #[serde(rename = "ACCOUNT_TYPE_STANDARD")]
    Standard,
    #[serde(rename = "ACCOUNT_TYPE_PREMIUM")]
    Premium,
    #[serde(rename = "ACCOUNT_TYPE_ENTERPRISE")]
    Enterprise,
    #[serde(rename = "ACCOUNT_TYPE_ENTERPRISE_PENDING")]
    EnterprisePending,
    #[serde(rename = "ACCOUNT_TYPE_INTEL")]
    Intel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRate {
    pub account_type: AccountType,
    pub rate: String,
    pub unit: String,
    #[serde(default)]
    pub usage_expr: String,
}

/// key: usage-models -> catalog product, immutable within a pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub vendor_id: String,
    pub family_id: String,
    pub match_expr: String,
    #[serde(default)]
    pub rates: Vec<ProductRate>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Quarantine reason codes shared by metering and product usage records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvalidityReason {
    Default,
    NoMatchingProduct,
    FailedToCalculateQty,
    FailedToGetProductRate,
    InvalidMeteringQty,
    DuplicateTransactionId,
}

impl InvalidityReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidityReason::Default => "DEFAULT",
            InvalidityReason::NoMatchingProduct => "NO_MATCHING_PRODUCT",
            InvalidityReason::FailedToCalculateQty => "FAILED_TO_CALCULATE_QTY",
            InvalidityReason::FailedToGetProductRate => "FAILED_TO_GET_PRODUCT_RATE",
            InvalidityReason::InvalidMeteringQty => "INVALID_METERING_QTY",
            InvalidityReason::DuplicateTransactionId => "DUPLICATE_TRANSACTION_ID",
        }
    }
}

impl fmt::Display for InvalidityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger rows expire one year after creation.
pub fn ledger_expiration(creation: DateTime<Utc>) -> DateTime<Utc> {
    creation
        .checked_add_months(Months::new(12))
        .unwrap_or(creation)
}

/// key: usage-ledger -> per-resource append-only billing row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ResourceUsage {
    pub id: Uuid,
    pub cloud_account_id: String,
    pub resource_id: String,
    pub resource_name: String,
    pub product_id: String,
    pub product_name: String,
    pub transaction_id: String,
    pub region: String,
    pub creation: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
    pub quantity: f64,
    pub unreported_quantity: f64,
    pub rate: f64,
    pub usage_unit_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub reported: bool,
}

/// key: usage-ledger -> per-account product rollup
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ProductUsage {
    pub id: Uuid,
    pub cloud_account_id: String,
    pub product_id: String,
    pub product_name: String,
    pub region: String,
    pub creation: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
    pub quantity: f64,
    pub rate: f64,
    pub usage_unit_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub idempotency_key: Option<String>,
}

impl ResourceUsage {
    /// Opens a fully unreported row; a blank `transaction_id` gets a fresh one.
    pub fn from_create(create: NewResourceUsage, now: DateTime<Utc>) -> Self {
        let transaction_id = if create.transaction_id.trim().is_empty() {
            Uuid::new_v4().to_string()
        } else {
            create.transaction_id
        };
        Self {
            id: Uuid::new_v4(),
            cloud_account_id: create.cloud_account_id,
            resource_id: create.resource_id,
            resource_name: create.resource_name,
            product_id: create.product_id,
            product_name: create.product_name,
            transaction_id,
            region: create.region,
            creation: now,
            expiration: ledger_expiration(now),
            quantity: create.quantity,
            unreported_quantity: create.quantity,
            rate: create.rate,
            usage_unit_type: create.usage_unit_type,
            start_time: create.start_time,
            end_time: create.end_time,
            reported: false,
        }
    }
}

impl ProductUsage {
    /// The product rollup row written alongside `usage`.
    pub fn for_resource_usage(usage: &ResourceUsage) -> Self {
        Self {
            id: Uuid::new_v4(),
            cloud_account_id: usage.cloud_account_id.clone(),
            product_id: usage.product_id.clone(),
            product_name: usage.product_name.clone(),
            region: usage.region.clone(),
            creation: usage.creation,
            expiration: usage.expiration,
            quantity: usage.quantity,
            rate: usage.rate,
            usage_unit_type: usage.usage_unit_type.clone(),
            start_time: usage.start_time,
            end_time: usage.end_time,
            idempotency_key: None,
        }
    }
}

/// key: usage-ledger -> externally supplied resource usage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewResourceUsage {
    pub cloud_account_id: String,
    pub resource_id: String,
    #[serde(default)]
    pub resource_name: String,
    pub product_id: String,
    pub product_name: String,
    #[serde(default)]
    pub transaction_id: String,
    pub region: String,
    pub quantity: f64,
    pub rate: f64,
    pub usage_unit_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Identifies a bulk upload entry whose pair could not be written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceUsageCreateFailed {
    pub cloud_account_id: String,
    pub resource_id: String,
    pub product_id: String,
    pub product_name: String,
    pub region: String,
    pub transaction_id: String,
}

impl From<&NewResourceUsage> for ResourceUsageCreateFailed {
    fn from(create: &NewResourceUsage) -> Self {
        Self {
            cloud_account_id: create.cloud_account_id.clone(),
            resource_id: create.resource_id.clone(),
            product_id: create.product_id.clone(),
            product_name: create.product_name.clone(),
            region: create.region.clone(),
            transaction_id: create.transaction_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BulkUploadOutcome {
    pub created: Vec<Uuid>,
    pub failed: Vec<ResourceUsageCreateFailed>,
}

/// key: usage-ledger -> downstream reporting handle for a product usage
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ProductUsageReport {
    pub id: Uuid,
    pub product_usage_id: Uuid,
    pub transaction_id: String,
    pub cloud_account_id: String,
    pub product_id: String,
    pub product_name: String,
    pub region: String,
    pub quantity: f64,
    pub rate: f64,
    pub unreported_quantity: f64,
    pub usage_unit_type: String,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub reported: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ProductUsageReport {
    pub fn for_usage(usage: &ProductUsage, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            product_usage_id: usage.id,
            transaction_id: Uuid::new_v4().to_string(),
            cloud_account_id: usage.cloud_account_id.clone(),
            product_id: usage.product_id.clone(),
            product_name: usage.product_name.clone(),
            region: usage.region.clone(),
            quantity: usage.quantity,
            rate: usage.rate,
            unreported_quantity: usage.quantity,
            usage_unit_type: usage.usage_unit_type.clone(),
            timestamp: now,
            created_at: now,
            reported: false,
            start_time: usage.start_time,
            end_time: usage.end_time,
        }
    }
}

/// key: usage-ledger -> per-resource bookmark, one row per resource
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ResourceMetering {
    pub id: Uuid,
    pub resource_id: String,
    pub cloud_account_id: String,
    pub transaction_id: String,
    pub region: String,
    pub last_recorded: DateTime<Utc>,
}

/// key: usage-records -> externally pre-aggregated usage
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ProductUsageRecord {
    pub id: Uuid,
    pub transaction_id: String,
    pub cloud_account_id: String,
    pub product_name: String,
    pub region: String,
    pub quantity: f64,
    pub timestamp: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub properties: Json<HashMap<String, String>>,
    pub reported: bool,
}

impl ProductUsageRecord {
    pub fn from_create(create: NewProductUsageRecord) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id: create.transaction_id,
            cloud_account_id: create.cloud_account_id,
            product_name: create.product_name,
            region: create.region,
            quantity: create.quantity,
            timestamp: create.timestamp,
            start_time: create.start_time,
            end_time: create.end_time,
            properties: Json(create.properties),
            reported: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProductUsageRecord {
    pub transaction_id: String,
    pub cloud_account_id: String,
    #[serde(default)]
    pub product_name: String,
    pub region: String,
    pub quantity: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// key: usage-records -> terminal quarantine copy
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct InvalidProductUsageRecord {
    pub id: Uuid,
    pub record_id: Option<Uuid>,
    pub transaction_id: String,
    pub cloud_account_id: String,
    pub product_name: String,
    pub region: String,
    pub quantity: f64,
    pub timestamp: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub invalidity_reason: String,
    pub properties: Json<HashMap<String, String>>,
}

impl InvalidProductUsageRecord {
    pub fn quarantine(
        record: &ProductUsageRecord,
        record_id: Option<Uuid>,
        reason: InvalidityReason,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            record_id,
            transaction_id: record.transaction_id.clone(),
            cloud_account_id: record.cloud_account_id.clone(),
            product_name: record.product_name.clone(),
            region: record.region.clone(),
            quantity: record.quantity,
            timestamp: record.timestamp,
            start_time: record.start_time,
            end_time: record.end_time,
            invalidity_reason: reason.as_str().to_string(),
            properties: record.properties.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductUsageFilter {
    #[serde(default)]
    pub cloud_account_id: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl ProductUsageFilter {
    pub fn accepts(&self, usage: &ProductUsage) -> bool {
        if let Some(account) = &self.cloud_account_id {
            if &usage.cloud_account_id != account {
                return false;
            }
        }
        if let Some(product_id) = &self.product_id {
            if &usage.product_id != product_id {
                return false;
            }
        }
        if let Some(region) = &self.region {
            if &usage.region != region {
                return false;
            }
        }
        if let Some(start) = self.start {
            if usage.start_time < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if usage.end_time > end {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsageFilter {
    #[serde(default)]
    pub cloud_account_id: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub reported: Option<bool>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl ResourceUsageFilter {
    pub fn accepts(&self, usage: &ResourceUsage) -> bool {
        self.cloud_account_id
            .as_ref()
            .map_or(true, |account| &usage.cloud_account_id == account)
            && self
                .resource_id
                .as_ref()
                .map_or(true, |resource| &usage.resource_id == resource)
            && self
                .region
                .as_ref()
                .map_or(true, |region| &usage.region == region)
            && self.reported.map_or(true, |reported| usage.reported == reported)
            && self.start.map_or(true, |start| usage.start_time >= start)
            && self.end.map_or(true, |end| usage.end_time <= end)
    }
}

/// Records without a window never match a `start` or `end` bound.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductUsageRecordFilter {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub cloud_account_id: Option<String>,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub reported: Option<bool>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl ProductUsageRecordFilter {
    pub fn accepts(&self, record: &ProductUsageRecord) -> bool {
        self.id.map_or(true, |id| record.id == id)
            && self
                .cloud_account_id
                .as_ref()
                .map_or(true, |account| &record.cloud_account_id == account)
            && self
                .transaction_id
                .as_ref()
                .map_or(true, |transaction| &record.transaction_id == transaction)
            && self
                .region
                .as_ref()
                .map_or(true, |region| &record.region == region)
            && self.reported.map_or(true, |reported| record.reported == reported)
            && self
                .start
                .map_or(true, |start| record.start_time.map_or(false, |at| at >= start))
            && self
                .end
                .map_or(true, |end| record.end_time.map_or(false, |at| at <= end))
    }
}

/// key: usage-summary -> region/product aggregation line
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UsageLine {
    pub product_id: String,
    pub product_name: String,
    pub region: String,
    pub quantity: f64,
    pub amount: f64,
    pub rate: f64,
    pub usage_unit_type: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UsageSummary {
    pub usages: Vec<UsageLine>,
    pub total_quantity: f64,
    pub total_amount: f64,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
}
