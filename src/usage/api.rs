use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppResult;

use super::{
    BulkUploadOutcome, IngestOutcome, InvalidProductUsageRecord, NewProductUsageRecord,
    NewResourceUsage, ProductUsage, ProductUsageFilter, ProductUsageRecord,
    ProductUsageRecordFilter, ProductUsageReport, ResourceUsage, ResourceUsageFilter,
    UsageService, UsageSummary,
};

#[derive(Debug, Deserialize)]
pub struct UnreportedQuantityUpdate {
    pub unreported_quantity: f64,
}

/// key: usage-api -> downstream billing consumer endpoints
pub async fn list_unreported_reports(
    Extension(service): Extension<UsageService>,
) -> AppResult<Json<Vec<ProductUsageReport>>> {
    Ok(Json(service.unreported_product_usage_reports().await?))
}

pub async fn update_report(
    Extension(service): Extension<UsageService>,
    Path(report_id): Path<Uuid>,
    Json(payload): Json<UnreportedQuantityUpdate>,
) -> AppResult<StatusCode> {
    service
        .update_product_usage_report(report_id, payload.unreported_quantity)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_report_reported(
    Extension(service): Extension<UsageService>,
    Path(report_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    service.mark_product_usage_as_reported(report_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_resource_usage(
    Extension(service): Extension<UsageService>,
    Path(resource_usage_id): Path<Uuid>,
    Json(payload): Json<UnreportedQuantityUpdate>,
) -> AppResult<StatusCode> {
    service
        .update_resource_usage(resource_usage_id, payload.unreported_quantity)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_resource_usage_reported(
    Extension(service): Extension<UsageService>,
    Path(resource_usage_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    service
        .mark_resource_usage_as_reported(resource_usage_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn record_product_usage(
    Extension(service): Extension<UsageService>,
    Json(payload): Json<NewProductUsageRecord>,
) -> AppResult<(StatusCode, Json<IngestOutcome>)> {
    let outcome = service.record_product_usage(payload).await?;
    let status = match outcome {
        IngestOutcome::Accepted { .. } => StatusCode::CREATED,
        IngestOutcome::Quarantined { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

pub async fn list_invalid_records(
    Extension(service): Extension<UsageService>,
) -> AppResult<Json<Vec<InvalidProductUsageRecord>>> {
    Ok(Json(service.invalid_product_usage_records().await?))
}

pub async fn usage_summary(
    Extension(service): Extension<UsageService>,
    Query(filter): Query<ProductUsageFilter>,
) -> AppResult<Json<UsageSummary>> {
    Ok(Json(service.usage_summary(&filter).await?))
}

pub async fn list_product_usage_records(
    Extension(service): Extension<UsageService>,
    Query(filter): Query<ProductUsageRecordFilter>,
) -> AppResult<Json<Vec<ProductUsageRecord>>> {
    Ok(Json(service.search_product_usage_records(&filter).await?))
}

/// key: usage-api -> externally supplied resource usages
pub async fn create_resource_usage(
    Extension(service): Extension<UsageService>,
    Json(payload): Json<NewResourceUsage>,
) -> AppResult<(StatusCode, Json<ResourceUsage>)> {
    let usage = service.create_resource_usage(payload).await?;
    Ok((StatusCode::CREATED, Json(usage)))
}

#[derive(Debug, Deserialize)]
pub struct BulkUploadRequest {
    pub resource_usages: Vec<NewResourceUsage>,
}

/// Responds 207 when any entry failed.
pub async fn bulk_upload_resource_usages(
    Extension(service): Extension<UsageService>,
    Json(payload): Json<BulkUploadRequest>,
) -> AppResult<(StatusCode, Json<BulkUploadOutcome>)> {
    let outcome = service
        .bulk_upload_resource_usages(payload.resource_usages)
        .await?;
    let status = if outcome.failed.is_empty() {
        StatusCode::CREATED
    } else {
        StatusCode::MULTI_STATUS
    };
    Ok((status, Json(outcome)))
}

pub async fn get_resource_usage(
    Extension(service): Extension<UsageService>,
    Path(resource_usage_id): Path<Uuid>,
) -> AppResult<Json<ResourceUsage>> {
    Ok(Json(service.resource_usage(resource_usage_id).await?))
}

pub async fn list_resource_usages(
    Extension(service): Extension<UsageService>,
    Query(filter): Query<ResourceUsageFilter>,
) -> AppResult<Json<Vec<ResourceUsage>>> {
    Ok(Json(service.search_resource_usages(&filter).await?))
}

pub async fn get_product_usage(
    Extension(service): Extension<UsageService>,
    Path(product_usage_id): Path<Uuid>,
) -> AppResult<Json<ProductUsage>> {
    Ok(Json(service.product_usage(product_usage_id).await?))
}

pub async fn list_product_usages(
    Extension(service): Extension<UsageService>,
    Query(filter): Query<ProductUsageFilter>,
) -> AppResult<Json<Vec<ProductUsage>>> {
    Ok(Json(service.search_product_usages(&filter).await?))
}
