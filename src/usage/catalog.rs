use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{info, warn};

use super::clients::ProductCatalogClient;
use super::matcher::product_matches;
use super::models::{AccountType, Product, Vendor, USAGE_UNIT_KEY};

/// Catalog problems that make every product suspect and abort the pass.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("vendor `{0}` is listed more than once in the product catalog")]
    DuplicateVendor(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProductInvalid {
    #[error("unknown vendor `{0}`")]
    UnknownVendor(String),
    #[error("family `{family_id}` does not belong to vendor `{vendor_id}`")]
    UnknownFamily { vendor_id: String, family_id: String },
    #[error("product has no rates")]
    NoRates,
    #[error("rate `{0}` is not a decimal")]
    InvalidRate(String),
    #[error("product has an empty match expression")]
    BlankMatchExpr,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("product `{product_id}` is invalid: {error}")]
pub struct ProductValidationError {
    pub product_id: String,
    #[source]
    pub error: ProductInvalid,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateError {
    #[error("failed to resolve account type for cloud account `{cloud_account_id}`: {message}")]
    AccountType {
        cloud_account_id: String,
        message: String,
    },
    #[error("product `{product_id}` has no rate for {account_type:?}")]
    NoRateForAccountType {
        product_id: String,
        account_type: AccountType,
    },
    #[error("product `{product_id}` has an invalid rate `{rate}`")]
    InvalidRate { product_id: String, rate: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRate {
    pub rate: f64,
    pub usage_unit_type: String,
}

/// key: usage-catalog -> filter products against vendors and families
pub fn validate_products(
    vendors: &[Vendor],
    products: Vec<Product>,
) -> Result<(Vec<Product>, Vec<ProductValidationError>), CatalogError> {
    let mut families_by_vendor: HashMap<&str, HashSet<&str>> = HashMap::new();
    for vendor in vendors {
        let families = vendor.families.iter().map(|f| f.id.as_str()).collect();
        if families_by_vendor
            .insert(vendor.id.as_str(), families)
            .is_some()
        {
            return Err(CatalogError::DuplicateVendor(vendor.id.clone()));
        }
    }

    let mut valid = Vec::new();
    let mut errors = Vec::new();
    for product in products {
        match check_product(&families_by_vendor, &product) {
            Ok(()) => valid.push(product),
            Err(error) => errors.push(ProductValidationError {
                product_id: product.id.clone(),
                error,
            }),
        }
    }
    Ok((valid, errors))
}

fn check_product(
    families_by_vendor: &HashMap<&str, HashSet<&str>>,
    product: &Product,
) -> Result<(), ProductInvalid> {
    let families = families_by_vendor
        .get(product.vendor_id.as_str())
        .ok_or_else(|| ProductInvalid::UnknownVendor(product.vendor_id.clone()))?;
    if !families.contains(product.family_id.as_str()) {
        return Err(ProductInvalid::UnknownFamily {
            vendor_id: product.vendor_id.clone(),
            family_id: product.family_id.clone(),
        });
    }
    if product.rates.is_empty() {
        return Err(ProductInvalid::NoRates);
    }
    if let Some(bad) = product
        .rates
        .iter()
        .find(|rate| rate.rate.trim().parse::<f64>().is_err())
    {
        return Err(ProductInvalid::InvalidRate(bad.rate.clone()));
    }
    if product.match_expr.trim().is_empty() {
        return Err(ProductInvalid::BlankMatchExpr);
    }
    Ok(())
}

/// Fetches vendors and products and keeps the valid ones. Any failure here is fatal to a pass.
pub async fn load_valid_products(catalog: &dyn ProductCatalogClient) -> Result<Vec<Product>> {
    let vendors = catalog
        .vendors()
        .await
        .context("failed to get vendors from product catalog")?;
    let products = catalog
        .products()
        .await
        .context("failed to get products from product catalog")?;

    let (valid, errors) =
        validate_products(&vendors, products).context("failed to validate products")?;
    for error in &errors {
        warn!(product_id = %error.product_id, error = %error.error, "product invalid");
    }
    info!(valid = valid.len(), invalid = errors.len(), "loaded product catalog");
    Ok(valid)
}

/// Products whose rule accepts the properties. Rule errors are logged and count as a non-match.
pub fn products_for_properties<'a>(
    products: &'a [Product],
    properties: &HashMap<String, String>,
) -> Vec<&'a Product> {
    products
        .iter()
        .filter(|product| match product_matches(product, properties) {
            Ok(matched) => matched,
            Err(err) => {
                warn!(?err, product_id = %product.id, "failed to match product to properties");
                false
            }
        })
        .collect()
}

pub fn rate_for_product(
    product: &Product,
    account_type: AccountType,
) -> Result<ResolvedRate, RateError> {
    let rate = product
        .rates
        .iter()
        .find(|rate| rate.account_type == account_type)
        .ok_or_else(|| RateError::NoRateForAccountType {
            product_id: product.id.clone(),
            account_type,
        })?;
    let value = rate
        .rate
        .trim()
        .parse::<f64>()
        .map_err(|_| RateError::InvalidRate {
            product_id: product.id.clone(),
            rate: rate.rate.clone(),
        })?;
    let usage_unit_type = product
        .metadata
        .get(USAGE_UNIT_KEY)
        .cloned()
        .unwrap_or_else(|| rate.unit.clone());
    Ok(ResolvedRate {
        rate: value,
        usage_unit_type,
    })
}
