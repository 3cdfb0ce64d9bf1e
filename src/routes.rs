use axum::{
    routing::{get, patch, post},
    Extension, Router,
};

use crate::usage::{api, UsageService};

async fn root() -> &'static str {
    "Usage Ledger API"
}

/// key: usage-http -> root plus usage routes bound to one service
pub fn app(service: UsageService) -> Router {
    Router::new()
        .route("/", get(root))
        .merge(api_routes())
        .layer(Extension(service))
}

pub fn api_routes() -> Router {
    Router::new()
        .route(
            "/api/usage/reports/unreported",
            get(api::list_unreported_reports),
        )
        .route("/api/usage/reports/:id", patch(api::update_report))
        .route(
            "/api/usage/reports/:id/reported",
            post(api::mark_report_reported),
        )
        .route(
            "/api/usage/resources",
            get(api::list_resource_usages).post(api::create_resource_usage),
        )
        .route(
            "/api/usage/resources/bulk",
            post(api::bulk_upload_resource_usages),
        )
        .route(
            "/api/usage/resources/:id",
            get(api::get_resource_usage).patch(api::update_resource_usage),
        )
        .route(
            "/api/usage/resources/:id/reported",
            post(api::mark_resource_usage_reported),
        )
        .route("/api/usage/products", get(api::list_product_usages))
        .route("/api/usage/products/:id", get(api::get_product_usage))
        .route(
            "/api/usage/records",
            get(api::list_product_usage_records).post(api::record_product_usage),
        )
        .route("/api/usage/records/invalid", get(api::list_invalid_records))
        .route("/api/usage/summary", get(api::usage_summary))
}
