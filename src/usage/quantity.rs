use std::collections::HashSet;

use thiserror::Error;

use super::models::MeteringRecord;

pub const SERVICE_TYPE_KEY: &str = "serviceType";
pub const RUNNING_SECONDS_KEY: &str = "runningSeconds";

#[derive(Debug, Error, PartialEq)]
pub enum QuantityError {
    #[error("no metering records to calculate a quantity from")]
    EmptyBatch,
    #[error("metering record {record_id} is missing property `{property}`")]
    MissingProperty { record_id: i64, property: String },
    #[error("metering record {record_id} property `{property}` is not numeric: `{value}`")]
    InvalidNumber {
        record_id: i64,
        property: String,
        value: String,
    },
    #[error("metering record {newer} reports less elapsed time than older record {older}")]
    OrderingViolation { newer: i64, older: i64 },
}

/// key: usage-quantity -> configuration for storage detection and property keys
#[derive(Debug, Clone)]
pub struct QuantityConfig {
    pub storage_service_types: HashSet<String>,
    pub storage_metric_unit_type: String,
    pub storage_time_metric_unit_type: String,
}

impl Default for QuantityConfig {
    fn default() -> Self {
        Self {
            storage_service_types: ["FileStorageAsAService", "ObjectStorageAsAService"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            storage_metric_unit_type: "TB".to_string(),
            storage_time_metric_unit_type: "hour".to_string(),
        }
    }
}

/// key: usage-quantity -> billable quantity from newest-first samples
#[derive(Debug, Clone)]
pub struct QuantityCalculator {
    config: QuantityConfig,
}

impl QuantityCalculator {
    pub fn new(config: QuantityConfig) -> Self {
        Self { config }
    }

    pub fn is_storage(&self, record: &MeteringRecord) -> bool {
        record
            .properties
            .get(SERVICE_TYPE_KEY)
            .map(|service_type| self.config.storage_service_types.contains(service_type))
            .unwrap_or(false)
    }

    pub fn quantity(&self, records: &[MeteringRecord]) -> Result<f64, QuantityError> {
        let newest = records.first().ok_or(QuantityError::EmptyBatch)?;
        if self.is_storage(newest) {
            self.storage_quantity(records)
        } else {
            compute_quantity(newest)
        }
    }

    /// Left Riemann sum: each interval is billed at the older sample's size.
    fn storage_quantity(&self, records: &[MeteringRecord]) -> Result<f64, QuantityError> {
        let samples = records
            .iter()
            .map(|record| {
                Ok((
                    record.id,
                    numeric_property(record, &self.config.storage_metric_unit_type)?,
                    numeric_property(record, &self.config.storage_time_metric_unit_type)?,
                ))
            })
            .collect::<Result<Vec<_>, QuantityError>>()?;

        if let [(_, storage, time)] = samples.as_slice() {
            return Ok(storage * time);
        }

        let mut total = 0.0;
        for pair in samples.windows(2) {
            let (newer_id, _, newer_time) = pair[0];
            let (older_id, older_storage, older_time) = pair[1];
            if newer_time < older_time {
                return Err(QuantityError::OrderingViolation {
                    newer: newer_id,
                    older: older_id,
                });
            }
            total += older_storage * (newer_time - older_time);
        }
        Ok(total)
    }
}

// runningSeconds is a cumulative counter, so only the newest sample matters.
fn compute_quantity(newest: &MeteringRecord) -> Result<f64, QuantityError> {
    Ok(numeric_property(newest, RUNNING_SECONDS_KEY)? / 60.0)
}

fn numeric_property(record: &MeteringRecord, property: &str) -> Result<f64, QuantityError> {
    let raw = record
        .properties
        .get(property)
        .ok_or_else(|| QuantityError::MissingProperty {
            record_id: record.id,
            property: property.to_string(),
        })?;
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| QuantityError::InvalidNumber {
            record_id: record.id,
            property: property.to_string(),
            value: raw.clone(),
        })
}
