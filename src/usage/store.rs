use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgQueryResult;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{
    InvalidProductUsageRecord, ProductUsage, ProductUsageFilter, ProductUsageRecord,
    ProductUsageRecordFilter, ProductUsageReport, ResourceMetering, ResourceUsage,
    ResourceUsageFilter,
};

/// key: usage-ledger-store -> append/sum/mark-reported over the ledger tables
///
/// Every method is a single statement; callers compose them without a surrounding transaction.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Newest `creation` first.
    async fn resource_usages_for_resource(&self, resource_id: &str)
        -> sqlx::Result<Vec<ResourceUsage>>;
    async fn total_resource_quantity(&self, resource_id: &str) -> sqlx::Result<f64>;
    async fn insert_resource_usage(&self, usage: &ResourceUsage) -> sqlx::Result<()>;
    async fn delete_resource_usage(&self, id: Uuid) -> sqlx::Result<()>;
    async fn update_resource_usage_unreported(
        &self,
        id: Uuid,
        unreported_quantity: f64,
    ) -> sqlx::Result<()>;
    async fn mark_resource_usage_reported(&self, id: Uuid) -> sqlx::Result<()>;
    async fn resource_usage_by_id(&self, id: Uuid) -> sqlx::Result<Option<ResourceUsage>>;
    /// Oldest `creation` first.
    async fn search_resource_usages(
        &self,
        filter: &ResourceUsageFilter,
    ) -> sqlx::Result<Vec<ResourceUsage>>;

    async fn insert_product_usage(&self, usage: &ProductUsage) -> sqlx::Result<()>;
    async fn delete_product_usage(&self, id: Uuid) -> sqlx::Result<()>;
    async fn product_usage_exists_for_key(&self, idempotency_key: &str) -> sqlx::Result<bool>;
    async fn product_usage_by_id(&self, id: Uuid) -> sqlx::Result<Option<ProductUsage>>;
    async fn search_product_usages(
        &self,
        filter: &ProductUsageFilter,
    ) -> sqlx::Result<Vec<ProductUsage>>;

    async fn insert_product_usage_report(&self, report: &ProductUsageReport) -> sqlx::Result<()>;
    async fn unreported_product_usage_reports(&self) -> sqlx::Result<Vec<ProductUsageReport>>;
    async fn update_product_usage_report(
        &self,
        id: Uuid,
        unreported_quantity: f64,
    ) -> sqlx::Result<()>;
    async fn mark_product_usage_report_reported(&self, id: Uuid) -> sqlx::Result<()>;

    /// Creates the bookmark or overwrites the existing one for the resource.
    async fn store_resource_metering(&self, metering: &ResourceMetering) -> sqlx::Result<()>;
    async fn update_resource_metering(
        &self,
        resource_id: &str,
        transaction_id: &str,
        last_recorded: DateTime<Utc>,
    ) -> sqlx::Result<()>;
    async fn resource_metering(&self, resource_id: &str)
        -> sqlx::Result<Option<ResourceMetering>>;

    /// Returns `false` without writing when `transaction_id` is already stored.
    async fn insert_product_usage_record(&self, record: &ProductUsageRecord)
        -> sqlx::Result<bool>;
    async fn product_usage_record_by_transaction(
        &self,
        transaction_id: &str,
    ) -> sqlx::Result<Option<ProductUsageRecord>>;
    /// Oldest `timestamp` first.
    async fn unreported_product_usage_records(&self) -> sqlx::Result<Vec<ProductUsageRecord>>;
    /// Oldest `timestamp` first.
    async fn search_product_usage_records(
        &self,
        filter: &ProductUsageRecordFilter,
    ) -> sqlx::Result<Vec<ProductUsageRecord>>;
    async fn mark_product_usage_record_reported(&self, id: Uuid) -> sqlx::Result<()>;
    async fn insert_invalid_product_usage_record(
        &self,
        record: &InvalidProductUsageRecord,
    ) -> sqlx::Result<()>;
    async fn invalid_product_usage_records(&self)
        -> sqlx::Result<Vec<InvalidProductUsageRecord>>;
}

#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn require_row(result: PgQueryResult) -> sqlx::Result<()> {
    if result.rows_affected() == 0 {
        return Err(sqlx::Error::RowNotFound);
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn resource_usages_for_resource(
        &self,
        resource_id: &str,
    ) -> sqlx::Result<Vec<ResourceUsage>> {
        sqlx::query_as::<_, ResourceUsage>(
            r#"
            SELECT
                id,
                cloud_account_id,
                resource_id,
                resource_name,
                product_id,
                product_name,
                transaction_id,
                region,
                creation,
                expiration,
                quantity,
                unreported_quantity,
                rate,
                usage_unit_type,
                start_time,
                end_time,
                reported
            FROM resource_usages
            WHERE resource_id = $1
            ORDER BY creation DESC
            "#,
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await
    }

    async fn total_resource_quantity(&self, resource_id: &str) -> sqlx::Result<f64> {
        sqlx::query_scalar::<_, f64>(
            "SELECT COALESCE(SUM(quantity), 0)::DOUBLE PRECISION FROM resource_usages WHERE resource_id = $1",
        )
        .bind(resource_id)
        .fetch_one(&self.pool)
        .await
    }

    async fn insert_resource_usage(&self, usage: &ResourceUsage) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO resource_usages (
                id,
                cloud_account_id,
                resource_id,
                resource_name,
                product_id,
                product_name,
                transaction_id,
                region,
                creation,
                expiration,
                quantity,
                unreported_quantity,
                rate,
                usage_unit_type,
                start_time,
                end_time,
                reported
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(usage.id)
        .bind(&usage.cloud_account_id)
        .bind(&usage.resource_id)
        .bind(&usage.resource_name)
        .bind(&usage.product_id)
        .bind(&usage.product_name)
        .bind(&usage.transaction_id)
        .bind(&usage.region)
        .bind(usage.creation)
        .bind(usage.expiration)
        .bind(usage.quantity)
        .bind(usage.unreported_quantity)
        .bind(usage.rate)
        .bind(&usage.usage_unit_type)
        .bind(usage.start_time)
        .bind(usage.end_time)
        .bind(usage.reported)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_resource_usage(&self, id: Uuid) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM resource_usages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_resource_usage_unreported(
        &self,
        id: Uuid,
        unreported_quantity: f64,
    ) -> sqlx::Result<()> {
        let result = sqlx::query("UPDATE resource_usages SET unreported_quantity = $1 WHERE id = $2")
            .bind(unreported_quantity)
            .bind(id)
            .execute(&self.pool)
            .await?;
        require_row(result)
    }

    async fn mark_resource_usage_reported(&self, id: Uuid) -> sqlx::Result<()> {
        let result = sqlx::query(
            "UPDATE resource_usages SET reported = TRUE, unreported_quantity = 0 WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        require_row(result)
    }

    async fn resource_usage_by_id(&self, id: Uuid) -> sqlx::Result<Option<ResourceUsage>> {
        sqlx::query_as::<_, ResourceUsage>(
            r#"
            SELECT
                id,
                cloud_account_id,
                resource_id,
                resource_name,
                product_id,
                product_name,
                transaction_id,
                region,
                creation,
                expiration,
                quantity,
                unreported_quantity,
                rate,
                usage_unit_type,
                start_time,
                end_time,
                reported
            FROM resource_usages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn search_resource_usages(
        &self,
        filter: &ResourceUsageFilter,
    ) -> sqlx::Result<Vec<ResourceUsage>> {
        sqlx::query_as::<_, ResourceUsage>(
            r#"
            SELECT
                id,
                cloud_account_id,
                resource_id,
                resource_name,
                product_id,
                product_name,
                transaction_id,
                region,
                creation,
                expiration,
                quantity,
                unreported_quantity,
                rate,
                usage_unit_type,
                start_time,
                end_time,
                reported
            FROM resource_usages
            WHERE ($1::TEXT IS NULL OR cloud_account_id = $1)
              AND ($2::TEXT IS NULL OR resource_id = $2)
              AND ($3::TEXT IS NULL OR region = $3)
              AND ($4::BOOLEAN IS NULL OR reported = $4)
              AND ($5::TIMESTAMPTZ IS NULL OR start_time >= $5)
              AND ($6::TIMESTAMPTZ IS NULL OR end_time <= $6)
            ORDER BY creation ASC
            "#,
        )
        .bind(&filter.cloud_account_id)
        .bind(&filter.resource_id)
        .bind(&filter.region)
        .bind(filter.reported)
        .bind(filter.start)
        .bind(filter.end)
        .fetch_all(&self.pool)
        .await
    }

    async fn insert_product_usage(&self, usage: &ProductUsage) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO product_usages (
                id,
                cloud_account_id,
                product_id,
                product_name,
                region,
                creation,
                expiration,
                quantity,
                rate,
                usage_unit_type,
                start_time,
                end_time,
                idempotency_key
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(usage.id)
        .bind(&usage.cloud_account_id)
        .bind(&usage.product_id)
        .bind(&usage.product_name)
        .bind(&usage.region)
        .bind(usage.creation)
        .bind(usage.expiration)
        .bind(usage.quantity)
        .bind(usage.rate)
        .bind(&usage.usage_unit_type)
        .bind(usage.start_time)
        .bind(usage.end_time)
        .bind(&usage.idempotency_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_product_usage(&self, id: Uuid) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM product_usages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn product_usage_exists_for_key(&self, idempotency_key: &str) -> sqlx::Result<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM product_usages WHERE idempotency_key = $1)",
        )
        .bind(idempotency_key)
        .fetch_one(&self.pool)
        .await
    }

    async fn product_usage_by_id(&self, id: Uuid) -> sqlx::Result<Option<ProductUsage>> {
        sqlx::query_as::<_, ProductUsage>(
            r#"
            SELECT
                id,
                cloud_account_id,
                product_id,
                product_name,
                region,
                creation,
                expiration,
                quantity,
                rate,
                usage_unit_type,
                start_time,
                end_time,
                idempotency_key
            FROM product_usages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn search_product_usages(
        &self,
        filter: &ProductUsageFilter,
    ) -> sqlx::Result<Vec<ProductUsage>> {
        sqlx::query_as::<_, ProductUsage>(
            r#"
            SELECT
                id,
                cloud_account_id,
                product_id,
                product_name,
                region,
                creation,
                expiration,
                quantity,
                rate,
                usage_unit_type,
                start_time,
                end_time,
                idempotency_key
            FROM product_usages
            WHERE ($1::TEXT IS NULL OR cloud_account_id = $1)
              AND ($2::TEXT IS NULL OR region = $2)
              AND ($3::TIMESTAMPTZ IS NULL OR start_time >= $3)
              AND ($4::TIMESTAMPTZ IS NULL OR end_time <= $4)
              AND ($5::TEXT IS NULL OR product_id = $5)
            ORDER BY creation ASC
            "#,
        )
        .bind(&filter.cloud_account_id)
        .bind(&filter.region)
        .bind(filter.start)
        .bind(filter.end)
        .bind(&filter.product_id)
        .fetch_all(&self.pool)
        .await
    }

    async fn insert_product_usage_report(&self, report: &ProductUsageReport) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO product_usages_report (
                id,
                product_usage_id,
                transaction_id,
                cloud_account_id,
                product_id,
                product_name,
                region,
                quantity,
                rate,
                unreported_quantity,
                usage_unit_type,
                timestamp,
                created_at,
                reported,
                start_time,
                end_time
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(report.id)
        .bind(report.product_usage_id)
        .bind(&report.transaction_id)
        .bind(&report.cloud_account_id)
        .bind(&report.product_id)
        .bind(&report.product_name)
        .bind(&report.region)
        .bind(report.quantity)
        .bind(report.rate)
        .bind(report.unreported_quantity)
        .bind(&report.usage_unit_type)
        .bind(report.timestamp)
        .bind(report.created_at)
        .bind(report.reported)
        .bind(report.start_time)
        .bind(report.end_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unreported_product_usage_reports(&self) -> sqlx::Result<Vec<ProductUsageReport>> {
        sqlx::query_as::<_, ProductUsageReport>(
            r#"
            SELECT
                id,
                product_usage_id,
                transaction_id,
                cloud_account_id,
                product_id,
                product_name,
                region,
                quantity,
                rate,
                unreported_quantity,
                usage_unit_type,
                timestamp,
                created_at,
                reported,
                start_time,
                end_time
            FROM product_usages_report
            WHERE reported = FALSE
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    async fn update_product_usage_report(
        &self,
        id: Uuid,
        unreported_quantity: f64,
    ) -> sqlx::Result<()> {
        let result =
            sqlx::query("UPDATE product_usages_report SET unreported_quantity = $1 WHERE id = $2")
                .bind(unreported_quantity)
                .bind(id)
                .execute(&self.pool)
                .await?;
        require_row(result)
    }

    async fn mark_product_usage_report_reported(&self, id: Uuid) -> sqlx::Result<()> {
        let result = sqlx::query(
            "UPDATE product_usages_report SET reported = TRUE, unreported_quantity = 0 WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        require_row(result)
    }

    async fn store_resource_metering(&self, metering: &ResourceMetering) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO resource_metering (
                id,
                resource_id,
                cloud_account_id,
                transaction_id,
                region,
                last_recorded
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (resource_id)
            DO UPDATE SET
                cloud_account_id = EXCLUDED.cloud_account_id,
                transaction_id = EXCLUDED.transaction_id,
                region = EXCLUDED.region,
                last_recorded = EXCLUDED.last_recorded
            "#,
        )
        .bind(metering.id)
        .bind(&metering.resource_id)
        .bind(&metering.cloud_account_id)
        .bind(&metering.transaction_id)
        .bind(&metering.region)
        .bind(metering.last_recorded)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_resource_metering(
        &self,
        resource_id: &str,
        transaction_id: &str,
        last_recorded: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        let result = sqlx::query(
            "UPDATE resource_metering SET transaction_id = $1, last_recorded = $2 WHERE resource_id = $3",
        )
        .bind(transaction_id)
        .bind(last_recorded)
        .bind(resource_id)
        .execute(&self.pool)
        .await?;
        require_row(result)
    }

    async fn resource_metering(
        &self,
        resource_id: &str,
    ) -> sqlx::Result<Option<ResourceMetering>> {
        sqlx::query_as::<_, ResourceMetering>(
            "SELECT id, resource_id, cloud_account_id, transaction_id, region, last_recorded FROM resource_metering WHERE resource_id = $1",
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn insert_product_usage_record(
        &self,
        record: &ProductUsageRecord,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO product_usage_records (
                id,
                transaction_id,
                cloud_account_id,
                product_name,
                region,
                quantity,
                timestamp,
                start_time,
                end_time,
                properties,
                reported
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (transaction_id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(&record.transaction_id)
        .bind(&record.cloud_account_id)
        .bind(&record.product_name)
        .bind(&record.region)
        .bind(record.quantity)
        .bind(record.timestamp)
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(&record.properties)
        .bind(record.reported)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn product_usage_record_by_transaction(
        &self,
        transaction_id: &str,
    ) -> sqlx::Result<Option<ProductUsageRecord>> {
        sqlx::query_as::<_, ProductUsageRecord>(
            r#"
            SELECT id, transaction_id, cloud_account_id, product_name, region, quantity,
                   timestamp, start_time, end_time, properties, reported
            FROM product_usage_records
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn unreported_product_usage_records(&self) -> sqlx::Result<Vec<ProductUsageRecord>> {
        sqlx::query_as::<_, ProductUsageRecord>(
            r#"
            SELECT id, transaction_id, cloud_account_id, product_name, region, quantity,
                   timestamp, start_time, end_time, properties, reported
            FROM product_usage_records
            WHERE reported = FALSE
            ORDER BY timestamp ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    async fn search_product_usage_records(
        &self,
        filter: &ProductUsageRecordFilter,
    ) -> sqlx::Result<Vec<ProductUsageRecord>> {
        sqlx::query_as::<_, ProductUsageRecord>(
            r#"
            SELECT id, transaction_id, cloud_account_id, product_name, region, quantity,
                   timestamp, start_time, end_time, properties, reported
            FROM product_usage_records
            WHERE ($1::UUID IS NULL OR id = $1)
              AND ($2::TEXT IS NULL OR cloud_account_id = $2)
              AND ($3::TEXT IS NULL OR transaction_id = $3)
              AND ($4::TEXT IS NULL OR region = $4)
              AND ($5::BOOLEAN IS NULL OR reported = $5)
              AND ($6::TIMESTAMPTZ IS NULL OR start_time >= $6)
              AND ($7::TIMESTAMPTZ IS NULL OR end_time <= $7)
            ORDER BY timestamp ASC
            "#,
        )
        .bind(filter.id)
        .bind(&filter.cloud_account_id)
        .bind(&filter.transaction_id)
        .bind(&filter.region)
        .bind(filter.reported)
        .bind(filter.start)
        .bind(filter.end)
        .fetch_all(&self.pool)
        .await
    }

    async fn mark_product_usage_record_reported(&self, id: Uuid) -> sqlx::Result<()> {
        let result = sqlx::query("UPDATE product_usage_records SET reported = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        require_row(result)
    }

    async fn insert_invalid_product_usage_record(
        &self,
        record: &InvalidProductUsageRecord,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO invalid_product_usage_records (
                id,
                record_id,
                transaction_id,
                cloud_account_id,
                product_name,
                region,
                quantity,
                timestamp,
                start_time,
                end_time,
                invalidity_reason,
                properties
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.id)
        .bind(record.record_id)
        .bind(&record.transaction_id)
        .bind(&record.cloud_account_id)
        .bind(&record.product_name)
        .bind(&record.region)
        .bind(record.quantity)
        .bind(record.timestamp)
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(&record.invalidity_reason)
        .bind(&record.properties)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn invalid_product_usage_records(
        &self,
    ) -> sqlx::Result<Vec<InvalidProductUsageRecord>> {
        sqlx::query_as::<_, InvalidProductUsageRecord>(
            r#"
            SELECT id, record_id, transaction_id, cloud_account_id, product_name, region,
                   quantity, timestamp, start_time, end_time, invalidity_reason, properties
            FROM invalid_product_usage_records
            ORDER BY timestamp ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }
}
