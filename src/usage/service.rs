use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::models::{
    BulkUploadOutcome, InvalidProductUsageRecord, InvalidityReason, NewProductUsageRecord,
    NewResourceUsage, ProductUsage, ProductUsageFilter, ProductUsageRecord,
    ProductUsageRecordFilter, ProductUsageReport, ResourceUsage, ResourceUsageCreateFailed,
    ResourceUsageFilter, UsageLine, UsageSummary,
};
use super::saga::write_usage_pair;
use super::store::LedgerStore;

#[derive(Debug, Error)]
pub enum UsageServiceError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Accepted { id: Uuid },
    Quarantined { reason: InvalidityReason },
}

/// key: usage-service -> reporting drain and record ingestion
#[derive(Clone)]
pub struct UsageService {
    store: Arc<dyn LedgerStore>,
}

impl UsageService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn record_product_usage(
        &self,
        create: NewProductUsageRecord,
    ) -> Result<IngestOutcome, UsageServiceError> {
        if create.transaction_id.trim().is_empty() {
            return Err(UsageServiceError::Invalid(
                "transaction_id must not be empty".to_string(),
            ));
        }
        if create.cloud_account_id.trim().is_empty() {
            return Err(UsageServiceError::Invalid(
                "cloud_account_id must not be empty".to_string(),
            ));
        }
        if !create.quantity.is_finite() || create.quantity < 0.0 {
            return Err(UsageServiceError::Invalid(
                "quantity must be a non-negative number".to_string(),
            ));
        }

        let record = ProductUsageRecord::from_create(create);
        if !self.store.insert_product_usage_record(&record).await? {
            let reason = InvalidityReason::DuplicateTransactionId;
            warn!(
                transaction_id = %record.transaction_id,
                cloud_account_id = %record.cloud_account_id,
                %reason,
                "quarantining duplicate product usage record"
            );
            self.store
                .insert_invalid_product_usage_record(&InvalidProductUsageRecord::quarantine(
                    &record, None, reason,
                ))
                .await?;
            return Ok(IngestOutcome::Quarantined { reason });
        }

        info!(record_id = %record.id, transaction_id = %record.transaction_id, "stored product usage record");
        Ok(IngestOutcome::Accepted { id: record.id })
    }

    pub async fn search_product_usage_records(
        &self,
        filter: &ProductUsageRecordFilter,
    ) -> Result<Vec<ProductUsageRecord>, UsageServiceError> {
        Ok(self.store.search_product_usage_records(filter).await?)
    }

    /// Writes the resource usage together with its product usage.
    pub async fn create_resource_usage(
        &self,
        create: NewResourceUsage,
    ) -> Result<ResourceUsage, UsageServiceError> {
        validate_resource_usage(&create)?;
        let resource_usage = ResourceUsage::from_create(create, Utc::now());
        let product_usage = ProductUsage::for_resource_usage(&resource_usage);
        write_usage_pair(self.store.as_ref(), &resource_usage, &product_usage).await?;
        info!(
            resource_usage_id = %resource_usage.id,
            resource_id = %resource_usage.resource_id,
            product_id = %resource_usage.product_id,
            "stored resource usage"
        );
        Ok(resource_usage)
    }

    /// Creates each entry independently; entries that fail validation or storage are returned.
    pub async fn bulk_upload_resource_usages(
        &self,
        creates: Vec<NewResourceUsage>,
    ) -> Result<BulkUploadOutcome, UsageServiceError> {
        let mut outcome = BulkUploadOutcome::default();
        for create in creates {
            let failed = ResourceUsageCreateFailed::from(&create);
            match self.create_resource_usage(create).await {
                Ok(usage) => outcome.created.push(usage.id),
                Err(err) => {
                    error!(
                        ?err,
                        resource_id = %failed.resource_id,
                        product_id = %failed.product_id,
                        "failed to upload resource usage"
                    );
                    outcome.failed.push(failed);
                }
            }
        }
        Ok(outcome)
    }

    pub async fn resource_usage(&self, id: Uuid) -> Result<ResourceUsage, UsageServiceError> {
        self.store
            .resource_usage_by_id(id)
            .await?
            .ok_or(UsageServiceError::Store(sqlx::Error::RowNotFound))
    }

    pub async fn search_resource_usages(
        &self,
        filter: &ResourceUsageFilter,
    ) -> Result<Vec<ResourceUsage>, UsageServiceError> {
        Ok(self.store.search_resource_usages(filter).await?)
    }

    pub async fn product_usage(&self, id: Uuid) -> Result<ProductUsage, UsageServiceError> {
        self.store
            .product_usage_by_id(id)
            .await?
            .ok_or(UsageServiceError::Store(sqlx::Error::RowNotFound))
    }

    pub async fn search_product_usages(
        &self,
        filter: &ProductUsageFilter,
    ) -> Result<Vec<ProductUsage>, UsageServiceError> {
        Ok(self.store.search_product_usages(filter).await?)
    }

    pub async fn invalid_product_usage_records(
        &self,
    ) -> Result<Vec<InvalidProductUsageRecord>, UsageServiceError> {
        Ok(self.store.invalid_product_usage_records().await?)
    }

    pub async fn unreported_product_usage_reports(
        &self,
    ) -> Result<Vec<ProductUsageReport>, UsageServiceError> {
        Ok(self.store.unreported_product_usage_reports().await?)
    }

    /// Lets the billing consumer record a partial submission.
    pub async fn update_product_usage_report(
        &self,
        id: Uuid,
        unreported_quantity: f64,
    ) -> Result<(), UsageServiceError> {
        validate_unreported(unreported_quantity)?;
        self.store
            .update_product_usage_report(id, unreported_quantity)
            .await?;
        Ok(())
    }

    pub async fn mark_product_usage_as_reported(&self, id: Uuid) -> Result<(), UsageServiceError> {
        self.store.mark_product_usage_report_reported(id).await?;
        info!(report_id = %id, "product usage report drained");
        Ok(())
    }

    pub async fn update_resource_usage(
        &self,
        id: Uuid,
        unreported_quantity: f64,
    ) -> Result<(), UsageServiceError> {
        validate_unreported(unreported_quantity)?;
        self.store
            .update_resource_usage_unreported(id, unreported_quantity)
            .await?;
        Ok(())
    }

    pub async fn mark_resource_usage_as_reported(&self, id: Uuid) -> Result<(), UsageServiceError> {
        self.store.mark_resource_usage_reported(id).await?;
        info!(resource_usage_id = %id, "resource usage drained");
        Ok(())
    }

    pub async fn usage_summary(
        &self,
        filter: &ProductUsageFilter,
    ) -> Result<UsageSummary, UsageServiceError> {
        let usages = self.store.search_product_usages(filter).await?;
        Ok(summarize(&usages))
    }
}

fn validate_unreported(unreported_quantity: f64) -> Result<(), UsageServiceError> {
    if !unreported_quantity.is_finite() || unreported_quantity < 0.0 {
        return Err(UsageServiceError::Invalid(
            "unreported_quantity must be a non-negative number".to_string(),
        ));
    }
    Ok(())
}

fn validate_resource_usage(create: &NewResourceUsage) -> Result<(), UsageServiceError> {
    let required = [
        ("cloud_account_id", &create.cloud_account_id),
        ("resource_id", &create.resource_id),
        ("product_id", &create.product_id),
        ("region", &create.region),
    ];
    if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
        return Err(UsageServiceError::Invalid(format!("{field} must not be empty")));
    }
    if !create.quantity.is_finite() || create.quantity < 0.0 {
        return Err(UsageServiceError::Invalid(
            "quantity must be a non-negative number".to_string(),
        ));
    }
    if !create.rate.is_finite() || create.rate < 0.0 {
        return Err(UsageServiceError::Invalid(
            "rate must be a non-negative number".to_string(),
        ));
    }
    if create.end_time < create.start_time {
        return Err(UsageServiceError::Invalid(
            "end_time must not precede start_time".to_string(),
        ));
    }
    Ok(())
}

/// Groups product usages by region and product.
pub fn summarize(usages: &[ProductUsage]) -> UsageSummary {
    let mut lines: BTreeMap<String, UsageLine> = BTreeMap::new();
    for usage in usages {
        let key = format!("{}:{}", usage.region, usage.product_id);
        let amount = usage.quantity * usage.rate;
        lines
            .entry(key)
            .and_modify(|line| {
                line.quantity += usage.quantity;
                line.amount += amount;
                line.start = line.start.min(usage.start_time);
                line.end = line.end.max(usage.end_time);
            })
            .or_insert_with(|| UsageLine {
                product_id: usage.product_id.clone(),
                product_name: usage.product_name.clone(),
                region: usage.region.clone(),
                quantity: usage.quantity,
                amount,
                rate: usage.rate,
                usage_unit_type: usage.usage_unit_type.clone(),
                start: usage.start_time,
                end: usage.end_time,
            });
    }

    let usages: Vec<UsageLine> = lines.into_values().collect();
    UsageSummary {
        total_quantity: usages.iter().map(|line| line.quantity).sum(),
        total_amount: usages.iter().map(|line| line.amount).sum(),
        period_start: usages.iter().map(|line| line.start).min(),
        period_end: usages.iter().map(|line| line.end).max(),
        usages,
    }
}
