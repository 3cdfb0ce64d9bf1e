use std::fmt::Debug;
use std::future::Future;

use futures_util::future::{BoxFuture, FutureExt};
use tracing::warn;

use super::models::{ProductUsage, ProductUsageReport, ResourceUsage};
use super::store::LedgerStore;

/// key: usage-saga -> undo for a committed ledger write
///
/// The undo future is only polled when the guarded step fails. An undo that fails itself is
/// logged and swallowed; the caller still receives the original error.
pub struct Compensation<'a> {
    label: &'static str,
    undo: BoxFuture<'a, sqlx::Result<()>>,
}

impl<'a> Compensation<'a> {
    pub fn new<F>(label: &'static str, undo: F) -> Self
    where
        F: Future<Output = sqlx::Result<()>> + Send + 'a,
    {
        Self {
            label,
            undo: undo.boxed(),
        }
    }

    pub async fn guard<T, E, F>(self, step: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Debug,
    {
        match step.await {
            Ok(value) => Ok(value),
            Err(err) => {
                if let Err(undo_err) = self.undo.await {
                    warn!(
                        ?err,
                        ?undo_err,
                        compensation = self.label,
                        "compensating delete failed after paired write failure"
                    );
                }
                Err(err)
            }
        }
    }
}

/// Writes a resource usage and its product rollup; the resource usage is deleted again when the
/// rollup insert fails.
pub async fn write_usage_pair(
    store: &dyn LedgerStore,
    resource_usage: &ResourceUsage,
    product_usage: &ProductUsage,
) -> sqlx::Result<()> {
    store.insert_resource_usage(resource_usage).await?;
    Compensation::new(
        "delete_resource_usage",
        store.delete_resource_usage(resource_usage.id),
    )
    .guard(store.insert_product_usage(product_usage))
    .await
}

/// Writes a product usage and its reporting handle; the product usage is deleted again when the
/// report insert fails.
pub async fn write_product_usage_with_report(
    store: &dyn LedgerStore,
    usage: &ProductUsage,
    report: &ProductUsageReport,
) -> sqlx::Result<()> {
    store.insert_product_usage(usage).await?;
    Compensation::new("delete_product_usage", store.delete_product_usage(usage.id))
        .guard(store.insert_product_usage_report(report))
        .await
}
