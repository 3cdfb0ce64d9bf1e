mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::{Extension, Router};
use common::*;
use serde_json::{json, Value};
use tower::ServiceExt;
use usage_ledger::api_routes;
use usage_ledger::usage::{FailPoint, UsageService};

fn app(harness: &Harness) -> Router {
    api_routes().layer(Extension(UsageService::new(harness.store.clone())))
}

async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn record_body(transaction_id: &str, quantity: f64) -> Value {
    json!({
        "transaction_id": transaction_id,
        "cloud_account_id": ACCOUNT,
        "product_name": "maas-inference",
        "region": REGION,
        "quantity": quantity,
        "timestamp": "2026-03-01T00:00:00Z",
        "start_time": "2026-02-28T23:00:00Z",
        "end_time": "2026-03-01T00:00:00Z",
        "properties": { "service": "maas" },
    })
}

fn resource_usage_body(resource_id: &str, product_id: &str, quantity: f64) -> Value {
    json!({
        "cloud_account_id": ACCOUNT,
        "resource_id": resource_id,
        "resource_name": format!("{resource_id}-name"),
        "product_id": product_id,
        "product_name": format!("{product_id}-name"),
        "region": REGION,
        "quantity": quantity,
        "rate": 0.05,
        "usage_unit_type": "RATE_UNIT_DOLLARS_PER_MINUTE",
        "start_time": "2026-03-01T00:00:00Z",
        "end_time": "2026-03-01T01:00:00Z",
    })
}

// key: usage-api-tests -> record ingestion endpoints
#[tokio::test]
async fn records_are_accepted_then_quarantined_as_duplicates() {
    let harness = Harness::new(vec![]);

    let (status, body) = send(
        app(&harness),
        Method::POST,
        "/api/usage/records",
        Some(record_body("tx-1", 12.5)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "accepted");
    assert!(body["id"].is_string());

    let (status, body) = send(
        app(&harness),
        Method::POST,
        "/api/usage/records",
        Some(record_body("tx-1", 12.5)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "quarantined");
    assert_eq!(body["reason"], "DUPLICATE_TRANSACTION_ID");

    let (status, body) = send(app(&harness), Method::GET, "/api/usage/records/invalid", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));
    assert_eq!(body[0]["transaction_id"], "tx-1");

    let (status, _) = send(
        app(&harness),
        Method::POST,
        "/api/usage/records",
        Some(record_body("tx-2", -3.0)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// key: usage-api-tests -> reporting drain
#[tokio::test]
async fn product_usage_reports_drain_through_the_api() {
    let harness = Harness::new(vec![product(
        "p-maas",
        "compute",
        r#"service == "maas""#,
        "0.002",
    )]);
    send(
        app(&harness),
        Method::POST,
        "/api/usage/records",
        Some(record_body("tx-1", 1000.0)),
    )
    .await;
    harness.controller.calculate_product_usages().await.unwrap();

    let (status, body) = send(app(&harness), Method::GET, "/api/usage/reports/unreported", None).await;
    assert_eq!(status, StatusCode::OK);
    let reports = body.as_array().cloned().unwrap_or_default();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0]["product_id"], "p-maas");
    let report_id = reports[0]["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        app(&harness),
        Method::PATCH,
        &format!("/api/usage/reports/{report_id}"),
        Some(json!({ "unreported_quantity": 400.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(approx(
        harness.store.product_usage_reports()[0].unreported_quantity,
        400.0
    ));

    let (status, _) = send(
        app(&harness),
        Method::PATCH,
        &format!("/api/usage/reports/{report_id}"),
        Some(json!({ "unreported_quantity": -1.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        app(&harness),
        Method::POST,
        &format!("/api/usage/reports/{report_id}/reported"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(app(&harness), Method::GET, "/api/usage/reports/unreported", None).await;
    assert_eq!(body.as_array().map(Vec::len), Some(0));
    let drained = &harness.store.product_usage_reports()[0];
    assert!(drained.reported);
    assert!(approx(drained.unreported_quantity, 0.0));
}

#[tokio::test]
async fn unknown_report_is_not_found() {
    let harness = Harness::new(vec![]);
    let (status, _) = send(
        app(&harness),
        Method::POST,
        &format!("/api/usage/reports/{}/reported", uuid::Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn resource_usages_drain_through_the_api() {
    let harness = Harness::new(vec![compute_product("p-small", "vm-small", "0.05")]);
    harness.metering.push(compute_record(1, "vm-1", "vm-small", 1200.0));
    harness.controller.calculate_usages().await.unwrap();
    let usage_id = harness.store.resource_usages()[0].id;

    let (status, _) = send(
        app(&harness),
        Method::PATCH,
        &format!("/api/usage/resources/{usage_id}"),
        Some(json!({ "unreported_quantity": 5.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(approx(harness.store.resource_usages()[0].unreported_quantity, 5.0));

    let (status, _) = send(
        app(&harness),
        Method::POST,
        &format!("/api/usage/resources/{usage_id}/reported"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let usage = &harness.store.resource_usages()[0];
    assert!(usage.reported);
    assert!(approx(usage.unreported_quantity, 0.0));
}

// key: usage-api-tests -> summary
#[tokio::test]
async fn summary_totals_billed_usage_per_product() {
    let harness = Harness::new(vec![
        compute_product("p-small", "vm-small", "0.05"),
        compute_product("p-large", "vm-large", "0.20"),
    ]);
    harness.metering.push(compute_record(1, "vm-1", "vm-small", 1200.0));
    harness.metering.push(compute_record(2, "vm-2", "vm-small", 600.0));
    harness.metering.push(compute_record(3, "vm-3", "vm-large", 600.0));
    harness.controller.calculate_usages().await.unwrap();

    let (status, body) = send(
        app(&harness),
        Method::GET,
        &format!("/api/usage/summary?cloud_account_id={ACCOUNT}&region={REGION}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let lines = body["usages"].as_array().cloned().unwrap_or_default();
    assert_eq!(lines.len(), 2);
    assert!(approx(body["total_quantity"].as_f64().unwrap(), 40.0));
    assert!(approx(body["total_amount"].as_f64().unwrap(), 30.0 * 0.05 + 10.0 * 0.20));

    let small = lines
        .iter()
        .find(|line| line["product_id"] == "p-small")
        .unwrap();
    assert!(approx(small["quantity"].as_f64().unwrap(), 30.0));

    let (_, body) = send(
        app(&harness),
        Method::GET,
        "/api/usage/summary?cloud_account_id=someone-else",
        None,
    )
    .await;
    assert_eq!(body["usages"].as_array().map(Vec::len), Some(0));
    assert!(approx(body["total_quantity"].as_f64().unwrap(), 0.0));
}

#[tokio::test]
async fn records_are_searchable_by_filter() {
    let harness = Harness::new(vec![]);
    for (transaction_id, quantity) in [("tx-1", 1.0), ("tx-2", 2.0)] {
        send(
            app(&harness),
            Method::POST,
            "/api/usage/records",
            Some(record_body(transaction_id, quantity)),
        )
        .await;
    }

    let (status, body) = send(
        app(&harness),
        Method::GET,
        "/api/usage/records?transaction_id=tx-2&reported=false",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));
    assert!(approx(body[0]["quantity"].as_f64().unwrap(), 2.0));

    let (_, body) = send(
        app(&harness),
        Method::GET,
        &format!("/api/usage/records?cloud_account_id={ACCOUNT}&start=2026-02-28T22:00:00Z"),
        None,
    )
    .await;
    assert_eq!(body.as_array().map(Vec::len), Some(2));

    let (_, body) = send(
        app(&harness),
        Method::GET,
        "/api/usage/records?start=2026-03-01T00:00:00Z",
        None,
    )
    .await;
    assert_eq!(body.as_array().map(Vec::len), Some(0));

    let (_, body) = send(app(&harness), Method::GET, "/api/usage/records?reported=true", None).await;
    assert_eq!(body.as_array().map(Vec::len), Some(0));
}

// key: usage-api-tests -> resource and product usage endpoints
#[tokio::test]
async fn created_resource_usage_is_paired_and_retrievable() {
    let harness = Harness::new(vec![]);

    let (status, created) = send(
        app(&harness),
        Method::POST,
        "/api/usage/resources",
        Some(resource_usage_body("vm-9", "p-small", 42.0)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(approx(created["unreported_quantity"].as_f64().unwrap(), 42.0));
    assert_eq!(created["reported"], false);
    assert!(!created["transaction_id"].as_str().unwrap().is_empty());
    let usage_id = created["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        app(&harness),
        Method::GET,
        &format!("/api/usage/resources/{usage_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resource_id"], "vm-9");

    let (_, body) = send(
        app(&harness),
        Method::GET,
        &format!("/api/usage/resources?resource_id=vm-9&cloud_account_id={ACCOUNT}"),
        None,
    )
    .await;
    assert_eq!(body.as_array().map(Vec::len), Some(1));
    let (_, body) = send(app(&harness), Method::GET, "/api/usage/resources?resource_id=vm-0", None).await;
    assert_eq!(body.as_array().map(Vec::len), Some(0));

    let (status, products) = send(
        app(&harness),
        Method::GET,
        &format!("/api/usage/products?product_id=p-small&region={REGION}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(products.as_array().map(Vec::len), Some(1));
    assert!(approx(products[0]["quantity"].as_f64().unwrap(), 42.0));
    let product_usage_id = products[0]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        app(&harness),
        Method::GET,
        &format!("/api/usage/products/{product_usage_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["product_name"], "p-small-name");

    for uri in [
        format!("/api/usage/resources/{}", uuid::Uuid::new_v4()),
        format!("/api/usage/products/{}", uuid::Uuid::new_v4()),
    ] {
        let (status, _) = send(app(&harness), Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    let (status, _) = send(
        app(&harness),
        Method::POST,
        "/api/usage/resources",
        Some(resource_usage_body(" ", "p-small", 1.0)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(harness.store.resource_usages().len(), 1);
}

#[tokio::test]
async fn failed_product_usage_write_removes_created_resource_usage() {
    let harness = Harness::new(vec![]);
    harness.store.fail_on(FailPoint::InsertProductUsage, 1);

    let (status, _) = send(
        app(&harness),
        Method::POST,
        "/api/usage/resources",
        Some(resource_usage_body("vm-9", "p-small", 42.0)),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(harness.store.resource_usages().is_empty());
    assert!(harness.store.product_usages().is_empty());
}

#[tokio::test]
async fn bulk_upload_returns_the_entries_that_failed() {
    let harness = Harness::new(vec![]);
    let body = json!({
        "resource_usages": [
            resource_usage_body("vm-1", "p-small", 10.0),
            resource_usage_body("vm-2", "p-small", 20.0),
        ]
    });

    let (status, outcome) = send(
        app(&harness),
        Method::POST,
        "/api/usage/resources/bulk",
        Some(body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(outcome["created"].as_array().map(Vec::len), Some(2));
    assert_eq!(outcome["failed"].as_array().map(Vec::len), Some(0));

    harness.store.fail_on(FailPoint::InsertProductUsage, 1);
    let (status, outcome) = send(
        app(&harness),
        Method::POST,
        "/api/usage/resources/bulk",
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::MULTI_STATUS);
    assert_eq!(outcome["created"].as_array().map(Vec::len), Some(1));
    assert_eq!(outcome["failed"].as_array().map(Vec::len), Some(1));
    assert_eq!(outcome["failed"][0]["resource_id"], "vm-1");

    assert_eq!(harness.store.resource_usages().len(), 3);
    assert_eq!(harness.store.product_usages().len(), 3);
}
