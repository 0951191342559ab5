mod common;

use chrono::Utc;
use serde_json::{json, Value};

use common::{date, harness, GEN_POLICY, WCP_POLICY};
use pdae::db::Repository;
use pdae::storage::ArtifactStore;

#[tokio::test]
async fn identical_requests_get_increasing_numbers() {
    let h = harness().await;
    let data = json!({"additional_insured_name": "Acme Realty"});

    let first = h
        .state
        .endorsements
        .create_endorsement(WCP_POLICY, "WCP-ADD-INSURED", data.clone(), Some(date(2024, 9, 1)))
        .await
        .unwrap();
    let second = h
        .state
        .endorsements
        .create_endorsement(WCP_POLICY, "WCP-ADD-INSURED", data, Some(date(2024, 9, 1)))
        .await
        .unwrap();

    assert_eq!(first.number, "END-WCP-000001-01");
    assert_eq!(second.number, "END-WCP-000001-02");
    assert_eq!((first.sequence, second.sequence), (1, 2));
    assert_eq!(first.title, "Additional Insured");
    assert_ne!(first.artifact_key, second.artifact_key);
    assert!(first.artifact_key.starts_with("endorsements/END-WCP-000001-01-"));

    for key in [&first.artifact_key, &second.artifact_key] {
        let bytes = h.store.get(key).await.unwrap();
        assert!(matches!(pdae::render::pdf::page_count(&bytes), Some(n) if n >= 1));
    }

    let listed = h.state.endorsements.list_endorsements(WCP_POLICY).await.unwrap();
    let numbers: Vec<&str> = listed.iter().map(|e| e.number.as_str()).collect();
    assert_eq!(numbers, vec!["END-WCP-000001-01", "END-WCP-000001-02"]);
}

#[tokio::test]
async fn missing_effective_date_defaults_to_today() {
    let h = harness().await;
    let endorsement = h
        .state
        .endorsements
        .create_endorsement(WCP_POLICY, "WCP-WAIVER", Value::Null, None)
        .await
        .unwrap();
    assert_eq!(endorsement.effective_date, Utc::now().date_naive());
    assert_eq!(endorsement.title, "Waiver of Subrogation");
}

#[tokio::test]
async fn endorsements_feed_later_package_snapshots() {
    let h = harness().await;
    h.state
        .endorsements
        .create_endorsement(
            WCP_POLICY,
            "WCP-WAIVER",
            json!({"waiver_party": "Port of Long Beach"}),
            Some(date(2024, 7, 15)),
        )
        .await
        .unwrap();

    let package = h.state.packages.create_package(WCP_POLICY, false).await.unwrap().package;
    let snapshot = h
        .state
        .repo
        .get_package(package.id)
        .await
        .unwrap()
        .unwrap()
        .merge_snapshot;
    assert_eq!(
        snapshot["endorsements"],
        json!([{
            "number": "END-WCP-000001-01",
            "title": "Waiver of Subrogation",
            "effective_date": "2024-07-15",
        }])
    );
}

#[tokio::test]
async fn unusable_templates_and_data_are_rejected() {
    let h = harness().await;
    let endorsements = &h.state.endorsements;

    let err = endorsements
        .create_endorsement(WCP_POLICY, "WCP-DEC-001", json!({}), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");
    assert!(err.to_string().contains("not an endorsement"));

    let err = endorsements
        .create_endorsement(GEN_POLICY, "WCP-ADD-INSURED", json!({}), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    let err = endorsements
        .create_endorsement(WCP_POLICY, "NO-SUCH-CODE", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, pdae::error::EngineError::NotFound(_)));

    let err = endorsements
        .create_endorsement(WCP_POLICY, "WCP-WAIVER", json!("text"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    let err = endorsements.list_endorsements(404).await.unwrap_err();
    assert!(matches!(err, pdae::error::EngineError::NotFound(_)));

    assert!(endorsements.list_endorsements(WCP_POLICY).await.unwrap().is_empty());
    assert!(h.store.keys().iter().all(|k| !k.starts_with("endorsements/")));
}
