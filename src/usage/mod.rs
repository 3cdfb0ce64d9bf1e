pub mod api;
pub mod catalog;
pub mod clients;
pub mod matcher;
pub mod memory;
pub mod models;
pub mod quantity;
pub mod reconciliation;
pub mod saga;
pub mod scheduler;
pub mod service;
pub mod store;

pub use catalog::{
    load_valid_products, products_for_properties, rate_for_product, validate_products,
    CatalogError, ProductInvalid, ProductValidationError, RateError, ResolvedRate,
};
pub use clients::{
    CloudAccountClient, HttpCloudAccountClient, HttpMeteringClient, HttpProductCatalogClient,
    MeteringClient, ProductCatalogClient,
};
pub use matcher::{matches, product_matches, CompareOp, Expr, MatchError};
pub use memory::{FailPoint, MemoryLedgerStore};
pub use models::{
    AccountType, BulkUploadOutcome, InvalidProductUsageRecord, InvalidityReason, MeteringRecord,
    NewProductUsageRecord, NewResourceUsage, Product, ProductFamily, ProductRate, ProductUsage,
    ProductUsageFilter, ProductUsageRecord, ProductUsageRecordFilter, ProductUsageReport,
    ResourceMetering, ResourceMeteringRecords, ResourceUsage, ResourceUsageCreateFailed,
    ResourceUsageFilter, UsageLine, UsageSummary, Vendor,
};
pub use quantity::{QuantityCalculator, QuantityConfig, QuantityError};
pub use reconciliation::{ControllerOptions, PassSummary, ReconcileError, UsageController};
pub use scheduler::{
    process_tick as run_usage_tick, spawn as spawn_usage_scheduler, PassOutcome, TickReport,
};
pub use service::{summarize, IngestOutcome, UsageService, UsageServiceError};
pub use store::{LedgerStore, PgLedgerStore};
