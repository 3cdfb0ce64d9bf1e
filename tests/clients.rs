use httpmock::prelude::*;
use serde_json::json;
use usage_ledger::usage::{
    load_valid_products, AccountType, CloudAccountClient, HttpCloudAccountClient,
    HttpMeteringClient, HttpProductCatalogClient, InvalidityReason, MeteringClient,
    MeteringRecord, ProductCatalogClient,
};

fn metering_record_json(id: i64, running_seconds: &str) -> serde_json::Value {
    json!({
        "id": id,
        "transaction_id": format!("tx-{id}"),
        "resource_id": "vm-1",
        "cloud_account_id": "cloud-account-1",
        "timestamp": "2026-03-01T00:10:00Z",
        "properties": {
            "serviceType": "ComputeAsAService",
            "runningSeconds": running_seconds,
        },
        "reported": true,
    })
}

// key: usage-collaborator-tests -> metering service contract
#[tokio::test]
async fn metering_client_covers_record_lifecycle() {
    let server = MockServer::start_async().await;

    let unreported_mock = server.mock(|when, then| {
        when.method(GET)
            .path("/v1/meteringrecords/unreported")
            .header("authorization", "Bearer metering-token");
        then.status(200).json_body(json!({
            "resources": [{
                "resource_id": "vm-1",
                "cloud_account_id": "cloud-account-1",
                "resource_name": "builder",
                "region": "us-region-1",
                "metering_records": [metering_record_json(7, "600")],
            }]
        }));
    });

    let previous_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/meteringrecords/previous")
            .json_body(json!({ "resource_id": "vm-1", "id": 7 }));
        then.status(200).json_body(metering_record_json(6, "300"));
    });

    let missing_previous_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/meteringrecords/previous")
            .json_body(json!({ "resource_id": "vm-1", "id": 6 }));
        then.status(404);
    });

    let reported_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/meteringrecords/reported")
            .json_body(json!({ "ids": [7] }));
        then.status(200);
    });

    let invalidate_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/meteringrecords/invalidate")
            .json_body_partial(r#"{ "reason": "NO_MATCHING_PRODUCT" }"#);
        then.status(200);
    });

    let client =
        HttpMeteringClient::new(server.base_url(), Some("metering-token".to_string())).unwrap();

    let groups = client.search_unreported_by_resource().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].resource_name, "builder");
    assert_eq!(groups[0].metering_records[0].id, 7);
    assert_eq!(
        groups[0].metering_records[0]
            .properties
            .get("runningSeconds")
            .map(String::as_str),
        Some("600")
    );

    let previous = client.find_previous_usage("vm-1", 7).await.unwrap();
    let previous: MeteringRecord = previous.expect("previous record present");
    assert_eq!(previous.id, 6);
    assert!(previous.reported);
    assert!(client.find_previous_usage("vm-1", 6).await.unwrap().is_none());

    client.update_as_reported(&[7]).await.unwrap();
    client
        .invalidate_records(&groups[0].metering_records, InvalidityReason::NoMatchingProduct)
        .await
        .unwrap();

    unreported_mock.assert();
    previous_mock.assert();
    missing_previous_mock.assert();
    reported_mock.assert();
    invalidate_mock.assert();
}

#[tokio::test]
async fn metering_client_surfaces_server_errors() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/v1/meteringrecords/reported");
        then.status(500);
    });

    let client = HttpMeteringClient::new(server.base_url(), None).unwrap();
    assert!(client.update_as_reported(&[1]).await.is_err());
}

// key: usage-collaborator-tests -> catalog and account contracts
#[tokio::test]
async fn catalog_client_feeds_product_validation() {
    let server = MockServer::start_async().await;

    server.mock(|when, then| {
        when.method(GET).path("/v1/vendors");
        then.status(200).json_body(json!({
            "vendors": [{
                "id": "idc",
                "name": "Cloud",
                "families": [{ "id": "compute", "name": "Compute" }],
            }]
        }));
    });
    server.mock(|when, then| {
        when.method(GET).path("/v1/products");
        then.status(200).json_body(json!({
            "products": [
                {
                    "id": "p-small",
                    "name": "vm-small",
                    "vendor_id": "idc",
                    "family_id": "compute",
                    "match_expr": "instanceType == \"vm-small\"",
                    "rates": [{
                        "account_type": "ACCOUNT_TYPE_STANDARD",
                        "rate": "0.05",
                        "unit": "RATE_UNIT_DOLLARS_PER_MINUTE",
                        "usage_expr": "time - previous.time",
                    }],
                    "metadata": { "usage.unit": "minutes" },
                },
                {
                    "id": "p-orphan",
                    "name": "orphan",
                    "vendor_id": "other",
                    "family_id": "compute",
                    "match_expr": "instanceType == \"vm-small\"",
                    "rates": [],
                }
            ]
        }));
    });

    let client = HttpProductCatalogClient::new(server.base_url(), None).unwrap();
    assert_eq!(client.products().await.unwrap().len(), 2);

    let products = load_valid_products(&client).await.unwrap();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].id, "p-small");
    assert_eq!(
        products[0].metadata.get("usage.unit").map(String::as_str),
        Some("minutes")
    );
}

#[tokio::test]
async fn cloud_account_client_reads_account_type() {
    let server = MockServer::start_async().await;
    let account_mock = server.mock(|when, then| {
        when.method(GET)
            .path("/v1/cloudaccounts/cloud-account-1")
            .header("authorization", "Bearer accounts-token");
        then.status(200)
            .json_body(json!({ "id": "cloud-account-1", "type": "ACCOUNT_TYPE_PREMIUM" }));
    });
    server.mock(|when, then| {
        when.method(GET).path("/v1/cloudaccounts/missing");
        then.status(404);
    });

    let client =
        HttpCloudAccountClient::new(server.base_url(), Some("accounts-token".to_string())).unwrap();
    assert_eq!(
        client.account_type("cloud-account-1").await.unwrap(),
        AccountType::Premium
    );
    assert!(client.account_type("missing").await.is_err());
    account_mock.assert();
}
