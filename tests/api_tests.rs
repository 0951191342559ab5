mod common;

use actix_web::{http::StatusCode, test, web, App};
use serde_json::{json, Value};

use common::{harness, GEN_POLICY, WCP_POLICY};
use pdae::endorsement::EndorsementSummary;
use pdae::package::{BulkResult, CombineResult, CreatePackageResult, StatusReport};
use pdae::ErrorResponse;

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state))
                .configure(pdae::configure),
        )
        .await
    };
}

#[actix_web::test]
async fn create_then_read_status() {
    let h = harness().await;
    let app = app!(h.state.clone());

    let req = test::TestRequest::post()
        .uri(&format!("/api/policies/{WCP_POLICY}/packages"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: CreatePackageResult = test::read_body_json(resp).await;
    assert_eq!(created.package.number, "POL-WCP-000001-00-DOC");

    let req = test::TestRequest::post()
        .uri(&format!("/api/policies/{WCP_POLICY}/packages"))
        .set_json(json!({"force": false}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = test::TestRequest::get()
        .uri(&format!("/api/policies/{WCP_POLICY}/documents/status"))
        .to_request();
    let report: StatusReport = test::call_and_read_body_json(&app, req).await;
    assert_eq!(report.policy_number, "POL-WCP-000001-00");
    assert_eq!(report.package.unwrap().components.len(), 3);
}

#[actix_web::test]
async fn unknown_policy_is_a_404_with_error_body() {
    let h = harness().await;
    let app = app!(h.state.clone());

    let req = test::TestRequest::get()
        .uri("/api/policies/404/documents/status")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: ErrorResponse = test::read_body_json(resp).await;
    assert_eq!(body.error, "validation_error");
    assert_eq!(body.message, "policy 404 not found");
}

#[actix_web::test]
async fn component_routes() {
    let h = harness().await;
    let package = h
        .state
        .packages
        .create_package(WCP_POLICY, false)
        .await
        .unwrap()
        .package;
    let app = app!(h.state.clone());

    let req = test::TestRequest::post()
        .uri(&format!("/api/policies/{WCP_POLICY}/components"))
        .set_json(json!({
            "template_id": h.templates.additional_insured.id,
            "custom": {"additional_insured_name": "Acme Realty"}
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let added: Value = test::read_body_json(resp).await;
    assert_eq!(added["sequence_order"], 4);
    assert_eq!(added["status"], "generated");

    let req = test::TestRequest::post()
        .uri(&format!(
            "/api/policies/{WCP_POLICY}/components/{}/regenerate",
            package.components[0].id
        ))
        .to_request();
    let regenerated: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(regenerated["status"], "generated");

    let req = test::TestRequest::delete()
        .uri(&format!(
            "/api/policies/{WCP_POLICY}/components/{}",
            added["id"].as_i64().unwrap()
        ))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = test::TestRequest::post()
        .uri(&format!("/api/policies/{WCP_POLICY}/documents/generate-missing"))
        .to_request();
    let summary: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(summary["total_count"], 0);
    assert_eq!(summary["package_status"], "generated");
}

#[actix_web::test]
async fn template_listing_validates_the_type_filter() {
    let h = harness().await;
    let app = app!(h.state.clone());

    let req = test::TestRequest::get()
        .uri(&format!("/api/policies/{WCP_POLICY}/templates?type=endorsement"))
        .to_request();
    let templates: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    let codes: Vec<&str> = templates.iter().filter_map(|t| t["code"].as_str()).collect();
    assert_eq!(codes, vec!["WCP-ADD-INSURED", "WCP-WAIVER"]);

    let req = test::TestRequest::get()
        .uri(&format!("/api/policies/{WCP_POLICY}/templates?state=NY"))
        .to_request();
    let templates: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert!(templates.iter().all(|t| t["code"] != "CA-NOTICE-001"));

    let req = test::TestRequest::get()
        .uri(&format!("/api/policies/{WCP_POLICY}/templates?type=brochure"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn bulk_requires_policies_and_keeps_order() {
    let h = harness().await;
    let app = app!(h.state.clone());

    let req = test::TestRequest::post()
        .uri("/api/documents/bulk")
        .set_json(json!({"policy_ids": []}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::post()
        .uri("/api/documents/bulk")
        .set_json(json!({"policy_ids": [GEN_POLICY, WCP_POLICY], "mode": "all"}))
        .to_request();
    let results: Vec<BulkResult> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(results[0].policy_id, GEN_POLICY);
    assert_eq!(results[1].package_number.as_deref(), Some("POL-WCP-000001-00-DOC"));
}

#[actix_web::test]
async fn combine_issue_deliver_and_download() {
    let h = harness().await;
    let package = h
        .state
        .packages
        .create_package(WCP_POLICY, false)
        .await
        .unwrap()
        .package;
    let app = app!(h.state.clone());

    let req = test::TestRequest::post()
        .uri(&format!("/api/packages/{}/combine", package.id))
        .to_request();
    let combined: CombineResult = test::call_and_read_body_json(&app, req).await;
    assert!(!combined.degraded);
    let key = combined.artifact_key.unwrap();

    let req = test::TestRequest::get()
        .uri(&format!("/artifacts/{key}"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/pdf"
    );
    let bytes = test::read_body(resp).await;
    assert!(bytes.starts_with(b"%PDF"));

    let req = test::TestRequest::get()
        .uri("/artifacts/policy-packages/2024/01/nope.pdf")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

    let req = test::TestRequest::post()
        .uri(&format!("/api/packages/{}/issue", package.id))
        .to_request();
    let issued: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(issued["status"], "issued");

    let req = test::TestRequest::post()
        .uri(&format!("/api/policies/{WCP_POLICY}/deliveries"))
        .set_json(json!({"recipients": ["ops@harborfreight.example"]}))
        .to_request();
    let receipt: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(receipt["channel"], "recording");
    assert_eq!(receipt["package_number"], "POL-WCP-000001-00-DOC");
    assert_eq!(h.delivery.requests.lock().len(), 1);
}

#[actix_web::test]
async fn endorsement_routes() {
    let h = harness().await;
    let app = app!(h.state.clone());

    let req = test::TestRequest::post()
        .uri(&format!("/api/policies/{WCP_POLICY}/endorsements"))
        .set_json(json!({
            "template_code": "WCP-ADD-INSURED",
            "data": {"additional_insured_name": "Acme Realty"},
            "effective_date": "2024-09-01"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: EndorsementSummary = test::read_body_json(resp).await;
    assert_eq!(created.number, "END-WCP-000001-01");

    let req = test::TestRequest::get()
        .uri(&format!("/api/policies/{WCP_POLICY}/endorsements"))
        .to_request();
    let listed: Vec<EndorsementSummary> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(listed, vec![created]);

    let req = test::TestRequest::post()
        .uri(&format!("/api/policies/{WCP_POLICY}/endorsements"))
        .set_json(json!({"template_code": "WCP-DEC-001"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn metrics_are_exposed() {
    let h = harness().await;
    h.state
        .packages
        .create_package(WCP_POLICY, false)
        .await
        .unwrap();
    let app = app!(h.state.clone());

    let req = test::TestRequest::get().uri("/metrics").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
    assert!(body.contains("pdae_renders_total"));
    assert!(body.contains("pdae_packages_created_total"));
}
