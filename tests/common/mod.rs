#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use usage_ledger::usage::{
    AccountType, CloudAccountClient, ControllerOptions, InvalidityReason, MemoryLedgerStore,
    MeteringClient, MeteringRecord, NewProductUsageRecord, Product, ProductCatalogClient,
    ProductFamily, ProductRate, QuantityCalculator, QuantityConfig, ResourceMeteringRecords,
    UsageController, Vendor,
};

pub const ACCOUNT: &str = "cloud-account-1";
pub const REGION: &str = "us-region-1";

#[derive(Debug, Clone)]
struct ResourceInfo {
    cloud_account_id: String,
    resource_name: String,
    region: String,
}

#[derive(Default)]
struct MeteringState {
    resources: Vec<(String, ResourceInfo)>,
    records: Vec<MeteringRecord>,
    invalidated: Vec<(Vec<i64>, InvalidityReason)>,
    invalid_ids: HashSet<i64>,
    fail_search: bool,
    fail_previous: bool,
}

/// Metering service double backed by an in-memory record log.
#[derive(Default)]
pub struct FakeMetering {
    state: Mutex<MeteringState>,
}

impl FakeMetering {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_resource(&self, resource_id: &str) {
        let mut state = self.state.lock().unwrap();
        if state.resources.iter().any(|(id, _)| id == resource_id) {
            return;
        }
        state.resources.push((
            resource_id.to_string(),
            ResourceInfo {
                cloud_account_id: ACCOUNT.to_string(),
                resource_name: format!("{resource_id}-name"),
                region: REGION.to_string(),
            },
        ));
    }

    pub fn push(&self, record: MeteringRecord) {
        self.register_resource(&record.resource_id);
        self.state.lock().unwrap().records.push(record);
    }

    pub fn fail_search(&self) {
        self.state.lock().unwrap().fail_search = true;
    }

    pub fn fail_previous_lookup(&self) {
        self.state.lock().unwrap().fail_previous = true;
    }

    pub fn reported_ids(&self) -> Vec<i64> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<i64> = state
            .records
            .iter()
            .filter(|record| record.reported)
            .map(|record| record.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn invalidated(&self) -> Vec<(Vec<i64>, InvalidityReason)> {
        self.state.lock().unwrap().invalidated.clone()
    }
}

#[async_trait]
impl MeteringClient for FakeMetering {
    async fn search_unreported_by_resource(&self) -> Result<Vec<ResourceMeteringRecords>> {
        let state = self.state.lock().unwrap();
        if state.fail_search {
            return Err(anyhow!("metering service unavailable"));
        }
        Ok(state
            .resources
            .iter()
            .map(|(resource_id, info)| {
                let mut records: Vec<MeteringRecord> = state
                    .records
                    .iter()
                    .filter(|record| {
                        &record.resource_id == resource_id
                            && !record.reported
                            && !state.invalid_ids.contains(&record.id)
                    })
                    .cloned()
                    .collect();
                records.sort_by(|a, b| b.id.cmp(&a.id));
                ResourceMeteringRecords {
                    resource_id: resource_id.clone(),
                    cloud_account_id: info.cloud_account_id.clone(),
                    resource_name: info.resource_name.clone(),
                    region: info.region.clone(),
                    metering_records: records,
                }
            })
            .collect())
    }

    async fn find_previous_usage(
        &self,
        resource_id: &str,
        before_id: i64,
    ) -> Result<Option<MeteringRecord>> {
        let state = self.state.lock().unwrap();
        if state.fail_previous {
            return Err(anyhow!("metering service unavailable"));
        }
        Ok(state
            .records
            .iter()
            .filter(|record| record.resource_id == resource_id && record.id < before_id)
            .max_by_key(|record| record.id)
            .cloned())
    }

    async fn update_as_reported(&self, ids: &[i64]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for record in state.records.iter_mut() {
            if ids.contains(&record.id) {
                record.reported = true;
            }
        }
        Ok(())
    }

    async fn invalidate_records(
        &self,
        records: &[MeteringRecord],
        reason: InvalidityReason,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let ids: Vec<i64> = records.iter().map(|record| record.id).collect();
        state.invalid_ids.extend(ids.iter().copied());
        state.invalidated.push((ids, reason));
        Ok(())
    }
}

pub struct FakeCatalog {
    vendors: Vec<Vendor>,
    products: Mutex<Vec<Product>>,
    fail: Mutex<bool>,
}

impl FakeCatalog {
    pub fn new(products: Vec<Product>) -> Self {
        Self {
            vendors: vec![vendor()],
            products: Mutex::new(products),
            fail: Mutex::new(false),
        }
    }

    pub fn set_products(&self, products: Vec<Product>) {
        *self.products.lock().unwrap() = products;
    }

    pub fn fail(&self) {
        *self.fail.lock().unwrap() = true;
    }
}

#[async_trait]
impl ProductCatalogClient for FakeCatalog {
    async fn vendors(&self) -> Result<Vec<Vendor>> {
        if *self.fail.lock().unwrap() {
            return Err(anyhow!("product catalog unavailable"));
        }
        Ok(self.vendors.clone())
    }

    async fn products(&self) -> Result<Vec<Product>> {
        Ok(self.products.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeAccounts {
    types: HashMap<String, AccountType>,
}

impl FakeAccounts {
    pub fn with(cloud_account_id: &str, account_type: AccountType) -> Self {
        let mut types = HashMap::new();
        types.insert(cloud_account_id.to_string(), account_type);
        Self { types }
    }
}

#[async_trait]
impl CloudAccountClient for FakeAccounts {
    async fn account_type(&self, cloud_account_id: &str) -> Result<AccountType> {
        self.types
            .get(cloud_account_id)
            .copied()
            .ok_or_else(|| anyhow!("cloud account {cloud_account_id} not found"))
    }
}

pub struct Harness {
    pub metering: Arc<FakeMetering>,
    pub catalog: Arc<FakeCatalog>,
    pub store: Arc<MemoryLedgerStore>,
    pub controller: UsageController,
}

impl Harness {
    pub fn new(products: Vec<Product>) -> Self {
        Self::with_options(products, ControllerOptions::default())
    }

    pub fn with_options(products: Vec<Product>, options: ControllerOptions) -> Self {
        let metering = Arc::new(FakeMetering::new());
        let catalog = Arc::new(FakeCatalog::new(products));
        let store = Arc::new(MemoryLedgerStore::new());
        let controller = UsageController::new(
            metering.clone(),
            catalog.clone(),
            Arc::new(FakeAccounts::with(ACCOUNT, AccountType::Standard)),
            store.clone(),
            QuantityCalculator::new(QuantityConfig::default()),
            options,
        );
        Self {
            metering,
            catalog,
            store,
            controller,
        }
    }
}

pub fn vendor() -> Vendor {
    Vendor {
        id: "idc".to_string(),
        name: "Cloud".to_string(),
        families: vec![
            ProductFamily {
                id: "compute".to_string(),
                name: "Compute".to_string(),
            },
            ProductFamily {
                id: "storage".to_string(),
                name: "Storage".to_string(),
            },
        ],
    }
}

pub fn product(id: &str, family_id: &str, match_expr: &str, rate: &str) -> Product {
    Product {
        id: id.to_string(),
        name: format!("{id}-name"),
        vendor_id: "idc".to_string(),
        family_id: family_id.to_string(),
        match_expr: match_expr.to_string(),
        rates: vec![ProductRate {
            account_type: AccountType::Standard,
            rate: rate.to_string(),
            unit: "RATE_UNIT_DOLLARS_PER_MINUTE".to_string(),
            usage_expr: "time - previous.time".to_string(),
        }],
        metadata: HashMap::new(),
    }
}

pub fn compute_product(id: &str, instance_type: &str, rate: &str) -> Product {
    product(
        id,
        "compute",
        &format!(r#"serviceType == "ComputeAsAService" && instanceType == "{instance_type}""#),
        rate,
    )
}

pub fn storage_product(id: &str, rate: &str) -> Product {
    product(id, "storage", r#"serviceType == "FileStorageAsAService""#, rate)
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

pub fn compute_record(
    id: i64,
    resource_id: &str,
    instance_type: &str,
    running_seconds: f64,
) -> MeteringRecord {
    MeteringRecord {
        id,
        transaction_id: format!("tx-{id}"),
        resource_id: resource_id.to_string(),
        cloud_account_id: ACCOUNT.to_string(),
        timestamp: base_time() + Duration::seconds(running_seconds as i64),
        properties: props(&[
            ("serviceType", "ComputeAsAService"),
            ("instanceType", instance_type),
            ("runningSeconds", &running_seconds.to_string()),
        ]),
        reported: false,
    }
}

pub fn storage_record(id: i64, resource_id: &str, terabytes: f64, hours: f64) -> MeteringRecord {
    MeteringRecord {
        id,
        transaction_id: format!("tx-{id}"),
        resource_id: resource_id.to_string(),
        cloud_account_id: ACCOUNT.to_string(),
        timestamp: base_time() + Duration::minutes((hours * 60.0) as i64),
        properties: props(&[
            ("serviceType", "FileStorageAsAService"),
            ("TB", &terabytes.to_string()),
            ("hour", &hours.to_string()),
        ]),
        reported: false,
    }
}

pub fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

pub fn new_record(
    transaction_id: &str,
    quantity: f64,
    properties: &[(&str, &str)],
) -> NewProductUsageRecord {
    NewProductUsageRecord {
        transaction_id: transaction_id.to_string(),
        cloud_account_id: ACCOUNT.to_string(),
        product_name: "maas-inference".to_string(),
        region: REGION.to_string(),
        quantity,
        timestamp: base_time(),
        start_time: Some(base_time() - Duration::hours(1)),
        end_time: Some(base_time()),
        properties: props(properties),
    }
}

pub fn approx(left: f64, right: f64) -> bool {
    (left - right).abs() < 1e-6
}
