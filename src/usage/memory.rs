use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{
    InvalidProductUsageRecord, ProductUsage, ProductUsageFilter, ProductUsageRecord,
    ProductUsageRecordFilter, ProductUsageReport, ResourceMetering, ResourceUsage,
    ResourceUsageFilter,
};
use super::store::LedgerStore;

/// Store operations that can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    InsertResourceUsage,
    DeleteResourceUsage,
    InsertProductUsage,
    DeleteProductUsage,
    InsertProductUsageReport,
    StoreResourceMetering,
    UpdateResourceMetering,
    MarkProductUsageRecordReported,
}

#[derive(Default)]
struct Tables {
    resource_usages: Vec<ResourceUsage>,
    product_usages: Vec<ProductUsage>,
    product_usage_reports: Vec<ProductUsageReport>,
    resource_metering: HashMap<String, ResourceMetering>,
    product_usage_records: Vec<ProductUsageRecord>,
    invalid_product_usage_records: Vec<InvalidProductUsageRecord>,
    failures: HashMap<FailPoint, usize>,
}

impl Tables {
    fn check(&mut self, point: FailPoint) -> sqlx::Result<()> {
        match self.failures.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(sqlx::Error::Protocol(format!("injected failure at {point:?}")))
            }
            _ => Ok(()),
        }
    }
}

/// key: usage-ledger-store -> in-process ledger for tests and local runs
#[derive(Default)]
pub struct MemoryLedgerStore {
    tables: Mutex<Tables>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next `times` calls at `point` fail.
    pub fn fail_on(&self, point: FailPoint, times: usize) {
        self.tables().failures.insert(point, times);
    }

    pub fn resource_usages(&self) -> Vec<ResourceUsage> {
        self.tables().resource_usages.clone()
    }

    pub fn product_usages(&self) -> Vec<ProductUsage> {
        self.tables().product_usages.clone()
    }

    pub fn product_usage_reports(&self) -> Vec<ProductUsageReport> {
        self.tables().product_usage_reports.clone()
    }

    pub fn bookmarks(&self) -> Vec<ResourceMetering> {
        self.tables().resource_metering.values().cloned().collect()
    }

    pub fn product_usage_records(&self) -> Vec<ProductUsageRecord> {
        self.tables().product_usage_records.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn resource_usages_for_resource(
        &self,
        resource_id: &str,
    ) -> sqlx::Result<Vec<ResourceUsage>> {
        let mut usages: Vec<_> = self
            .tables()
            .resource_usages
            .iter()
            .filter(|usage| usage.resource_id == resource_id)
            .cloned()
            .collect();
        usages.sort_by(|a, b| b.creation.cmp(&a.creation));
        Ok(usages)
    }

    async fn total_resource_quantity(&self, resource_id: &str) -> sqlx::Result<f64> {
        Ok(self
            .tables()
            .resource_usages
            .iter()
            .filter(|usage| usage.resource_id == resource_id)
            .map(|usage| usage.quantity)
            .sum())
    }

    async fn insert_resource_usage(&self, usage: &ResourceUsage) -> sqlx::Result<()> {
        let mut tables = self.tables();
        tables.check(FailPoint::InsertResourceUsage)?;
        tables.resource_usages.push(usage.clone());
        Ok(())
    }

    async fn delete_resource_usage(&self, id: Uuid) -> sqlx::Result<()> {
        let mut tables = self.tables();
        tables.check(FailPoint::DeleteResourceUsage)?;
        tables.resource_usages.retain(|usage| usage.id != id);
        Ok(())
    }

    async fn update_resource_usage_unreported(
        &self,
        id: Uuid,
        unreported_quantity: f64,
    ) -> sqlx::Result<()> {
        let mut tables = self.tables();
        let usage = tables
            .resource_usages
            .iter_mut()
            .find(|usage| usage.id == id)
            .ok_or(sqlx::Error::RowNotFound)?;
        usage.unreported_quantity = unreported_quantity;
        Ok(())
    }

    async fn mark_resource_usage_reported(&self, id: Uuid) -> sqlx::Result<()> {
        let mut tables = self.tables();
        let usage = tables
            .resource_usages
            .iter_mut()
            .find(|usage| usage.id == id)
            .ok_or(sqlx::Error::RowNotFound)?;
        usage.reported = true;
        usage.unreported_quantity = 0.0;
        Ok(())
    }

    async fn resource_usage_by_id(&self, id: Uuid) -> sqlx::Result<Option<ResourceUsage>> {
        Ok(self
            .tables()
            .resource_usages
            .iter()
            .find(|usage| usage.id == id)
            .cloned())
    }

    async fn search_resource_usages(
        &self,
        filter: &ResourceUsageFilter,
    ) -> sqlx::Result<Vec<ResourceUsage>> {
        let mut usages: Vec<_> = self
            .tables()
            .resource_usages
            .iter()
            .filter(|usage| filter.accepts(usage))
            .cloned()
            .collect();
        usages.sort_by(|a, b| a.creation.cmp(&b.creation));
        Ok(usages)
    }

    async fn insert_product_usage(&self, usage: &ProductUsage) -> sqlx::Result<()> {
        let mut tables = self.tables();
        tables.check(FailPoint::InsertProductUsage)?;
        if let Some(key) = &usage.idempotency_key {
            if tables
                .product_usages
                .iter()
                .any(|existing| existing.idempotency_key.as_ref() == Some(key))
            {
                return Err(sqlx::Error::Protocol(format!(
                    "duplicate product usage idempotency key {key}"
                )));
            }
        }
        tables.product_usages.push(usage.clone());
        Ok(())
    }

    async fn delete_product_usage(&self, id: Uuid) -> sqlx::Result<()> {
        let mut tables = self.tables();
        tables.check(FailPoint::DeleteProductUsage)?;
        tables.product_usages.retain(|usage| usage.id != id);
        Ok(())
    }

    async fn product_usage_exists_for_key(&self, idempotency_key: &str) -> sqlx::Result<bool> {
        Ok(self
            .tables()
            .product_usages
            .iter()
            .any(|usage| usage.idempotency_key.as_deref() == Some(idempotency_key)))
    }

    async fn product_usage_by_id(&self, id: Uuid) -> sqlx::Result<Option<ProductUsage>> {
        Ok(self
            .tables()
            .product_usages
            .iter()
            .find(|usage| usage.id == id)
            .cloned())
    }

    async fn search_product_usages(
        &self,
        filter: &ProductUsageFilter,
    ) -> sqlx::Result<Vec<ProductUsage>> {
        Ok(self
            .tables()
            .product_usages
            .iter()
            .filter(|usage| filter.accepts(usage))
            .cloned()
            .collect())
    }

    async fn insert_product_usage_report(&self, report: &ProductUsageReport) -> sqlx::Result<()> {
        let mut tables = self.tables();
        tables.check(FailPoint::InsertProductUsageReport)?;
        tables.product_usage_reports.push(report.clone());
        Ok(())
    }

    async fn unreported_product_usage_reports(&self) -> sqlx::Result<Vec<ProductUsageReport>> {
        Ok(self
            .tables()
            .product_usage_reports
            .iter()
            .filter(|report| !report.reported)
            .cloned()
            .collect())
    }

    async fn update_product_usage_report(
        &self,
        id: Uuid,
        unreported_quantity: f64,
    ) -> sqlx::Result<()> {
        let mut tables = self.tables();
        let report = tables
            .product_usage_reports
            .iter_mut()
            .find(|report| report.id == id)
            .ok_or(sqlx::Error::RowNotFound)?;
        report.unreported_quantity = unreported_quantity;
        Ok(())
    }

    async fn mark_product_usage_report_reported(&self, id: Uuid) -> sqlx::Result<()> {
        let mut tables = self.tables();
        let report = tables
            .product_usage_reports
            .iter_mut()
            .find(|report| report.id == id)
            .ok_or(sqlx::Error::RowNotFound)?;
        report.reported = true;
        report.unreported_quantity = 0.0;
        Ok(())
    }

    async fn store_resource_metering(&self, metering: &ResourceMetering) -> sqlx::Result<()> {
        let mut tables = self.tables();
        tables.check(FailPoint::StoreResourceMetering)?;
        tables
            .resource_metering
            .insert(metering.resource_id.clone(), metering.clone());
        Ok(())
    }

    async fn update_resource_metering(
        &self,
        resource_id: &str,
        transaction_id: &str,
        last_recorded: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        let mut tables = self.tables();
        tables.check(FailPoint::UpdateResourceMetering)?;
        let bookmark = tables
            .resource_metering
            .get_mut(resource_id)
            .ok_or(sqlx::Error::RowNotFound)?;
        bookmark.transaction_id = transaction_id.to_string();
        bookmark.last_recorded = last_recorded;
        Ok(())
    }

    async fn resource_metering(
        &self,
        resource_id: &str,
    ) -> sqlx::Result<Option<ResourceMetering>> {
        Ok(self.tables().resource_metering.get(resource_id).cloned())
    }

    async fn insert_product_usage_record(
        &self,
        record: &ProductUsageRecord,
    ) -> sqlx::Result<bool> {
        let mut tables = self.tables();
        if tables
            .product_usage_records
            .iter()
            .any(|existing| existing.transaction_id == record.transaction_id)
        {
            return Ok(false);
        }
        tables.product_usage_records.push(record.clone());
        Ok(true)
    }

    async fn product_usage_record_by_transaction(
        &self,
        transaction_id: &str,
    ) -> sqlx::Result<Option<ProductUsageRecord>> {
        Ok(self
            .tables()
            .product_usage_records
            .iter()
            .find(|record| record.transaction_id == transaction_id)
            .cloned())
    }

    async fn unreported_product_usage_records(&self) -> sqlx::Result<Vec<ProductUsageRecord>> {
        let mut records: Vec<_> = self
            .tables()
            .product_usage_records
            .iter()
            .filter(|record| !record.reported)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }

    async fn search_product_usage_records(
        &self,
        filter: &ProductUsageRecordFilter,
    ) -> sqlx::Result<Vec<ProductUsageRecord>> {
        let mut records: Vec<_> = self
            .tables()
            .product_usage_records
            .iter()
            .filter(|record| filter.accepts(record))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }

    async fn mark_product_usage_record_reported(&self, id: Uuid) -> sqlx::Result<()> {
        let mut tables = self.tables();
        tables.check(FailPoint::MarkProductUsageRecordReported)?;
        let record = tables
            .product_usage_records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or(sqlx::Error::RowNotFound)?;
        record.reported = true;
        Ok(())
    }

    async fn insert_invalid_product_usage_record(
        &self,
        record: &InvalidProductUsageRecord,
    ) -> sqlx::Result<()> {
        self.tables()
            .invalid_product_usage_records
            .push(record.clone());
        Ok(())
    }

    async fn invalid_product_usage_records(
        &self,
    ) -> sqlx::Result<Vec<InvalidProductUsageRecord>> {
        Ok(self.tables().invalid_product_usage_records.clone())
    }
}
