use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use super::models::{
    AccountType, InvalidityReason, MeteringRecord, Product, ResourceMeteringRecords, Vendor,
};

/// key: usage-collaborators -> metering service
#[async_trait]
pub trait MeteringClient: Send + Sync {
    /// Unreported records grouped by resource, each group newest first.
    async fn search_unreported_by_resource(&self) -> Result<Vec<ResourceMeteringRecords>>;

    /// Latest record of the resource with an id lower than `before_id`.
    async fn find_previous_usage(
        &self,
        resource_id: &str,
        before_id: i64,
    ) -> Result<Option<MeteringRecord>>;

    async fn update_as_reported(&self, ids: &[i64]) -> Result<()>;

    async fn invalidate_records(
        &self,
        records: &[MeteringRecord],
        reason: InvalidityReason,
    ) -> Result<()>;
}

/// key: usage-collaborators -> product catalog
#[async_trait]
pub trait ProductCatalogClient: Send + Sync {
    async fn vendors(&self) -> Result<Vec<Vendor>>;
    async fn products(&self) -> Result<Vec<Product>>;
}

/// key: usage-collaborators -> cloud accounts
#[async_trait]
pub trait CloudAccountClient: Send + Sync {
    async fn account_type(&self, cloud_account_id: &str) -> Result<AccountType>;
}

#[derive(Clone)]
struct ServiceEndpoint {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl ServiceEndpoint {
    fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build collaborator client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            auth_token,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.auth_token {
            request.bearer_auth(token)
        } else {
            request
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.auth(self.client.get(self.endpoint(path)))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.auth(self.client.post(self.endpoint(path)))
    }
}

#[derive(Clone)]
pub struct HttpMeteringClient {
    endpoint: ServiceEndpoint,
}

#[derive(Debug, Deserialize)]
struct UnreportedResponse {
    #[serde(default)]
    resources: Vec<ResourceMeteringRecords>,
}

impl HttpMeteringClient {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        Ok(Self {
            endpoint: ServiceEndpoint::new(base_url, auth_token)?,
        })
    }
}

#[async_trait]
impl MeteringClient for HttpMeteringClient {
    async fn search_unreported_by_resource(&self) -> Result<Vec<ResourceMeteringRecords>> {
        let response: UnreportedResponse = self
            .endpoint
            .get("v1/meteringrecords/unreported")
            .send()
            .await
            .context("failed to contact metering service")?
            .error_for_status()
            .context("metering service rejected unreported search")?
            .json()
            .await
            .context("failed to decode unreported metering records")?;
        Ok(response.resources)
    }

    async fn find_previous_usage(
        &self,
        resource_id: &str,
        before_id: i64,
    ) -> Result<Option<MeteringRecord>> {
        let response = self
            .endpoint
            .post("v1/meteringrecords/previous")
            .json(&json!({ "resource_id": resource_id, "id": before_id }))
            .send()
            .await
            .context("failed to contact metering service")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record = response
            .error_for_status()
            .context("metering service rejected previous usage lookup")?
            .json()
            .await
            .context("failed to decode previous metering record")?;
        Ok(Some(record))
    }

    async fn update_as_reported(&self, ids: &[i64]) -> Result<()> {
        self.endpoint
            .post("v1/meteringrecords/reported")
            .json(&json!({ "ids": ids }))
            .send()
            .await
            .context("failed to contact metering service")?
            .error_for_status()
            .context("metering service rejected reported update")?;
        Ok(())
    }

    async fn invalidate_records(
        &self,
        records: &[MeteringRecord],
        reason: InvalidityReason,
    ) -> Result<()> {
        self.endpoint
            .post("v1/meteringrecords/invalidate")
            .json(&json!({ "records": records, "reason": reason }))
            .send()
            .await
            .context("failed to contact metering service")?
            .error_for_status()
            .context("metering service rejected record invalidation")?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct HttpProductCatalogClient {
    endpoint: ServiceEndpoint,
}

#[derive(Debug, Deserialize)]
struct VendorsResponse {
    #[serde(default)]
    vendors: Vec<Vendor>,
}

#[derive(Debug, Deserialize)]
struct ProductsResponse {
    #[serde(default)]
    products: Vec<Product>,
}

impl HttpProductCatalogClient {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        Ok(Self {
            endpoint: ServiceEndpoint::new(base_url, auth_token)?,
        })
    }
}

#[async_trait]
impl ProductCatalogClient for HttpProductCatalogClient {
    async fn vendors(&self) -> Result<Vec<Vendor>> {
        let response: VendorsResponse = self
            .endpoint
            .get("v1/vendors")
            .send()
            .await
            .context("failed to contact product catalog")?
            .error_for_status()
            .context("product catalog rejected vendor listing")?
            .json()
            .await
            .context("failed to decode vendors")?;
        Ok(response.vendors)
    }

    async fn products(&self) -> Result<Vec<Product>> {
        let response: ProductsResponse = self
            .endpoint
            .get("v1/products")
            .send()
            .await
            .context("failed to contact product catalog")?
            .error_for_status()
            .context("product catalog rejected product listing")?
            .json()
            .await
            .context("failed to decode products")?;
        Ok(response.products)
    }
}

#[derive(Clone)]
pub struct HttpCloudAccountClient {
    endpoint: ServiceEndpoint,
}

#[derive(Debug, Deserialize)]
struct CloudAccountResponse {
    #[serde(rename = "type")]
    account_type: AccountType,
}

impl HttpCloudAccountClient {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        Ok(Self {
            endpoint: ServiceEndpoint::new(base_url, auth_token)?,
        })
    }
}

#[async_trait]
impl CloudAccountClient for HttpCloudAccountClient {
    async fn account_type(&self, cloud_account_id: &str) -> Result<AccountType> {
        let response: CloudAccountResponse = self
            .endpoint
            .get(&format!("v1/cloudaccounts/{cloud_account_id}"))
            .send()
            .await
            .context("failed to contact cloud account service")?
            .error_for_status()
            .context("cloud account service rejected lookup")?
            .json()
            .await
            .context("failed to decode cloud account")?;
        Ok(response.account_type)
    }
}
