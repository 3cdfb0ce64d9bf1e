use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::catalog::{
    load_valid_products, products_for_properties, rate_for_product, RateError, ResolvedRate,
};
use super::clients::{CloudAccountClient, MeteringClient, ProductCatalogClient};
use super::models::{
    ledger_expiration, InvalidProductUsageRecord, InvalidityReason, MeteringRecord, Product,
    ProductUsage, ProductUsageRecord, ProductUsageReport, ResourceMetering,
    ResourceMeteringRecords, ResourceUsage,
};
use super::quantity::{QuantityCalculator, QuantityError};
use super::saga::{write_product_usage_with_report, write_usage_pair};
use super::store::LedgerStore;

#[derive(Debug, Clone, Default)]
pub struct ControllerOptions {
    /// Tag product usages with `{record_id}:{product_id}` and skip keys already written.
    pub product_usage_dedup: bool,
}

/// key: usage-reconciliation -> per-resource failure
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("no product matches the metering properties")]
    NoMatchingProduct,
    #[error(transparent)]
    Quantity(#[from] QuantityError),
    #[error(transparent)]
    Rate(#[from] RateError),
    #[error("recomputed quantity {quantity} is below the previously billed {previous}")]
    NegativeDelta { quantity: f64, previous: f64 },
    #[error("ledger operation failed: {0}")]
    Store(#[from] sqlx::Error),
}

impl ReconcileError {
    /// Reason the batch is quarantined under; `None` leaves it for the next pass.
    pub fn invalidity_reason(&self) -> Option<InvalidityReason> {
        match self {
            ReconcileError::NoMatchingProduct => Some(InvalidityReason::NoMatchingProduct),
            ReconcileError::Quantity(_) => Some(InvalidityReason::FailedToCalculateQty),
            ReconcileError::Rate(_) => Some(InvalidityReason::FailedToGetProductRate),
            ReconcileError::NegativeDelta { .. } => Some(InvalidityReason::InvalidMeteringQty),
            ReconcileError::Store(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub billed: usize,
    pub quarantined: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy)]
struct UsageWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl UsageWindow {
    fn of(records: &[MeteringRecord]) -> Result<Self, QuantityError> {
        let newest = records.first().ok_or(QuantityError::EmptyBatch)?;
        let oldest = records.last().ok_or(QuantityError::EmptyBatch)?;
        Ok(Self {
            start: oldest.timestamp,
            end: newest.timestamp,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    NoMatch,
    Complete,
    Partial { added: usize, matched: usize },
}

/// key: usage-reconciliation -> metering to ledger controller
pub struct UsageController {
    metering: Arc<dyn MeteringClient>,
    catalog: Arc<dyn ProductCatalogClient>,
    accounts: Arc<dyn CloudAccountClient>,
    store: Arc<dyn LedgerStore>,
    calculator: QuantityCalculator,
    options: ControllerOptions,
}

impl UsageController {
    pub fn new(
        metering: Arc<dyn MeteringClient>,
        catalog: Arc<dyn ProductCatalogClient>,
        accounts: Arc<dyn CloudAccountClient>,
        store: Arc<dyn LedgerStore>,
        calculator: QuantityCalculator,
        options: ControllerOptions,
    ) -> Self {
        Self {
            metering,
            catalog,
            accounts,
            store,
            calculator,
            options,
        }
    }

    /// Bills every unreported metering batch. Only a catalog failure aborts the pass.
    pub async fn calculate_usages(&self) -> Result<PassSummary> {
        info!("calculating usages across cloud accounts");
        let products = load_valid_products(self.catalog.as_ref()).await?;
        let groups = self
            .metering
            .search_unreported_by_resource()
            .await
            .context("failed to get unreported resource metering records")?;

        let mut summary = PassSummary::default();
        for group in groups {
            if group.metering_records.is_empty() {
                debug!(resource_id = %group.resource_id, "no unreported metering records for resource");
                summary.skipped += 1;
                continue;
            }

            match self.reconcile_resource(&products, &group).await {
                Ok(()) => match self.mark_reported(&group.metering_records).await {
                    Ok(()) => {
                        info!(
                            resource_id = %group.resource_id,
                            cloud_account_id = %group.cloud_account_id,
                            records = group.metering_records.len(),
                            "billed resource usage"
                        );
                        summary.billed += 1;
                    }
                    Err(err) => {
                        warn!(?err, resource_id = %group.resource_id, "failed to mark metering records as reported");
                        summary.failed += 1;
                    }
                },
                Err(err) => match err.invalidity_reason() {
                    Some(reason) => {
                        warn!(
                            error = %err,
                            resource_id = %group.resource_id,
                            %reason,
                            "quarantining metering records"
                        );
                        if let Err(invalidate_err) = self
                            .metering
                            .invalidate_records(&group.metering_records, reason)
                            .await
                        {
                            warn!(?invalidate_err, resource_id = %group.resource_id, "failed to invalidate metering records");
                        }
                        summary.quarantined += 1;
                    }
                    None => {
                        warn!(error = %err, resource_id = %group.resource_id, "failed to bill resource usage");
                        summary.failed += 1;
                    }
                },
            }
        }

        info!(
            billed = summary.billed,
            quarantined = summary.quarantined,
            failed = summary.failed,
            skipped = summary.skipped,
            "usage calculation pass finished"
        );
        Ok(summary)
    }

    /// Bills unreported product usage records that were aggregated upstream.
    pub async fn calculate_product_usages(&self) -> Result<PassSummary> {
        info!("calculating product usages across cloud accounts");
        let products = load_valid_products(self.catalog.as_ref()).await?;
        let records = self
            .store
            .unreported_product_usage_records()
            .await
            .context("failed to get unreported product usage records")?;

        let mut summary = PassSummary::default();
        for record in records {
            match self.reconcile_product_usage_record(&products, &record).await {
                RecordOutcome::Complete => {
                    match self.store.mark_product_usage_record_reported(record.id).await {
                        Ok(()) => summary.billed += 1,
                        Err(err) => {
                            warn!(?err, record_id = %record.id, "failed to mark product usage record as reported");
                            summary.failed += 1;
                        }
                    }
                }
                RecordOutcome::Partial { added, matched } => {
                    warn!(
                        record_id = %record.id,
                        added,
                        matched,
                        "product usage record partially billed; leaving it unreported"
                    );
                    summary.failed += 1;
                }
                RecordOutcome::NoMatch => {
                    match self.quarantine_product_usage_record(&record).await {
                        Ok(()) => summary.quarantined += 1,
                        Err(err) => {
                            warn!(?err, record_id = %record.id, "failed to quarantine product usage record");
                            summary.failed += 1;
                        }
                    }
                }
            }
        }

        info!(
            billed = summary.billed,
            quarantined = summary.quarantined,
            failed = summary.failed,
            "product usage calculation pass finished"
        );
        Ok(summary)
    }

    async fn reconcile_resource(
        &self,
        products: &[Product],
        group: &ResourceMeteringRecords,
    ) -> Result<(), ReconcileError> {
        let existing = self
            .store
            .resource_usages_for_resource(&group.resource_id)
            .await?;
        match existing.first() {
            None => self.bill_first_usage(products, group).await,
            Some(last) => self.bill_incremental_usage(group, last).await,
        }
    }

    async fn bill_first_usage(
        &self,
        products: &[Product],
        group: &ResourceMeteringRecords,
    ) -> Result<(), ReconcileError> {
        let records = &group.metering_records;
        let newest = records.first().ok_or(QuantityError::EmptyBatch)?;

        let matched = products_for_properties(products, &newest.properties);
        if matched.is_empty() {
            return Err(ReconcileError::NoMatchingProduct);
        }

        let quantity = self.calculator.quantity(records)?;
        let rates = self.resolve_rates(&group.cloud_account_id, &matched).await?;
        let window = UsageWindow::of(records)?;

        for (product, rate) in rates {
            debug!(resource_id = %group.resource_id, product_id = %product.id, "found mapped product for resource");
            self.add_usages(
                group,
                &product.id,
                &product.name,
                quantity,
                rate.rate,
                &rate.usage_unit_type,
                window,
            )
            .await?;
        }

        self.store
            .store_resource_metering(&ResourceMetering {
                id: Uuid::new_v4(),
                resource_id: group.resource_id.clone(),
                cloud_account_id: group.cloud_account_id.clone(),
                transaction_id: newest.transaction_id.clone(),
                region: group.region.clone(),
                last_recorded: newest.timestamp,
            })
            .await?;
        Ok(())
    }

    async fn bill_incremental_usage(
        &self,
        group: &ResourceMeteringRecords,
        last: &ResourceUsage,
    ) -> Result<(), ReconcileError> {
        let records = &group.metering_records;
        let newest = records.first().ok_or(QuantityError::EmptyBatch)?;
        let oldest = records.last().ok_or(QuantityError::EmptyBatch)?;
        let mut previous = self.store.total_resource_quantity(&group.resource_id).await?;

        let mut series = records.clone();
        match self
            .metering
            .find_previous_usage(&group.resource_id, oldest.id)
            .await
        {
            Ok(Some(prior)) if prior.reported => series.push(prior),
            Ok(_) => {}
            Err(err) => warn!(
                ?err,
                resource_id = %group.resource_id,
                storage = self.calculator.is_storage(newest),
                "previous metering record unavailable, billing batch without it"
            ),
        }

        let quantity = self.calculator.quantity(&series)?;
        // storage series only integrate the new interval, so the whole quantity is new
        if self.calculator.is_storage(newest) {
            previous = 0.0;
        }
        if quantity < previous {
            return Err(ReconcileError::NegativeDelta { quantity, previous });
        }

        debug!(
            resource_id = %group.resource_id,
            quantity,
            previous,
            last_usage = %last.id,
            "adding incremental resource usage"
        );
        self.add_usages(
            group,
            &last.product_id,
            &last.product_name,
            quantity - previous,
            last.rate,
            &last.usage_unit_type,
            UsageWindow::of(records)?,
        )
        .await?;

        match self
            .store
            .update_resource_metering(&group.resource_id, &newest.transaction_id, newest.timestamp)
            .await
        {
            Err(sqlx::Error::RowNotFound) => {
                self.store
                    .store_resource_metering(&ResourceMetering {
                        id: Uuid::new_v4(),
                        resource_id: group.resource_id.clone(),
                        cloud_account_id: group.cloud_account_id.clone(),
                        transaction_id: newest.transaction_id.clone(),
                        region: group.region.clone(),
                        last_recorded: newest.timestamp,
                    })
                    .await?
            }
            other => other?,
        }
        Ok(())
    }

    async fn resolve_rates<'p>(
        &self,
        cloud_account_id: &str,
        products: &[&'p Product],
    ) -> Result<Vec<(&'p Product, ResolvedRate)>, RateError> {
        let account_type = self
            .accounts
            .account_type(cloud_account_id)
            .await
            .map_err(|err| RateError::AccountType {
                cloud_account_id: cloud_account_id.to_string(),
                message: format!("{err:#}"),
            })?;
        products
            .iter()
            .map(|product| rate_for_product(product, account_type).map(|rate| (*product, rate)))
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    async fn add_usages(
        &self,
        group: &ResourceMeteringRecords,
        product_id: &str,
        product_name: &str,
        quantity: f64,
        rate: f64,
        usage_unit_type: &str,
        window: UsageWindow,
    ) -> Result<(), ReconcileError> {
        let now = Utc::now();
        let resource_usage = ResourceUsage {
            id: Uuid::new_v4(),
            cloud_account_id: group.cloud_account_id.clone(),
            resource_id: group.resource_id.clone(),
            resource_name: group.resource_name.clone(),
            product_id: product_id.to_string(),
            product_name: product_name.to_string(),
            transaction_id: Uuid::new_v4().to_string(),
            region: group.region.clone(),
            creation: now,
            expiration: ledger_expiration(now),
            quantity,
            unreported_quantity: quantity,
            rate,
            usage_unit_type: usage_unit_type.to_string(),
            start_time: window.start,
            end_time: window.end,
            reported: false,
        };
        let product_usage = ProductUsage::for_resource_usage(&resource_usage);
        write_usage_pair(self.store.as_ref(), &resource_usage, &product_usage).await?;
        Ok(())
    }

    async fn mark_reported(&self, records: &[MeteringRecord]) -> Result<()> {
        let ids: Vec<i64> = records.iter().map(|record| record.id).collect();
        self.metering.update_as_reported(&ids).await
    }

    async fn reconcile_product_usage_record(
        &self,
        products: &[Product],
        record: &ProductUsageRecord,
    ) -> RecordOutcome {
        let matched = products_for_properties(products, &record.properties);
        if matched.is_empty() {
            return RecordOutcome::NoMatch;
        }

        let account_type = match self.accounts.account_type(&record.cloud_account_id).await {
            Ok(account_type) => account_type,
            Err(err) => {
                warn!(?err, record_id = %record.id, cloud_account_id = %record.cloud_account_id, "failed to get account type");
                return RecordOutcome::Partial {
                    added: 0,
                    matched: matched.len(),
                };
            }
        };

        let now = Utc::now();
        let mut added = 0;
        for product in &matched {
            let rate = match rate_for_product(product, account_type) {
                Ok(rate) => rate,
                Err(err) => {
                    warn!(error = %err, record_id = %record.id, "failed to get rate for product");
                    continue;
                }
            };

            let idempotency_key = self
                .options
                .product_usage_dedup
                .then(|| format!("{}:{}", record.id, product.id));
            if let Some(key) = &idempotency_key {
                match self.store.product_usage_exists_for_key(key).await {
                    Ok(true) => {
                        debug!(record_id = %record.id, product_id = %product.id, "product usage already recorded");
                        added += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(?err, record_id = %record.id, "failed to check product usage key");
                        continue;
                    }
                }
            }

            let usage = ProductUsage {
                id: Uuid::new_v4(),
                cloud_account_id: record.cloud_account_id.clone(),
                product_id: product.id.clone(),
                product_name: product.name.clone(),
                region: record.region.clone(),
                creation: now,
                expiration: ledger_expiration(now),
                quantity: record.quantity,
                rate: rate.rate,
                usage_unit_type: rate.usage_unit_type.clone(),
                start_time: record.start_time.unwrap_or(record.timestamp),
                end_time: record.end_time.unwrap_or(record.timestamp),
                idempotency_key,
            };
            match self.add_product_usage(&usage, now).await {
                Ok(()) => added += 1,
                Err(err) => {
                    warn!(?err, record_id = %record.id, product_id = %product.id, "failed to add product usage")
                }
            }
        }

        if added == matched.len() {
            RecordOutcome::Complete
        } else {
            RecordOutcome::Partial {
                added,
                matched: matched.len(),
            }
        }
    }

    async fn add_product_usage(&self, usage: &ProductUsage, now: DateTime<Utc>) -> sqlx::Result<()> {
        let report = ProductUsageReport::for_usage(usage, now);
        write_product_usage_with_report(self.store.as_ref(), usage, &report).await
    }

    async fn quarantine_product_usage_record(&self, record: &ProductUsageRecord) -> sqlx::Result<()> {
        warn!(record_id = %record.id, reason = %InvalidityReason::NoMatchingProduct, "quarantining product usage record");
        self.store
            .insert_invalid_product_usage_record(&InvalidProductUsageRecord::quarantine(
                record,
                Some(record.id),
                InvalidityReason::NoMatchingProduct,
            ))
            .await?;
        self.store.mark_product_usage_record_reported(record.id).await
    }
}
