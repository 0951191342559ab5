mod common;

use serde_json::json;

use common::{harness, harness_with, GEN_POLICY, NY_POLICY, POLICY_FORM_KEY, WCP_POLICY};
use pdae::db::Repository;
use pdae::models::{ComponentStatus, NewComponent, NewPackage, PackageStatus, TemplateType};
use pdae::package::BulkMode;
use pdae::storage::ArtifactStore;

#[tokio::test]
async fn fresh_package_renders_every_template_in_order() {
    let h = harness().await;
    let result = h.state.packages.create_package(WCP_POLICY, false).await.unwrap();
    assert!(result.created);

    let package = result.package;
    assert_eq!(package.number, "POL-WCP-000001-00-DOC");
    assert_eq!(package.version, 0);
    assert!(package.is_current);
    assert_eq!(package.status, PackageStatus::Generated);

    let orders: Vec<i32> = package.components.iter().map(|c| c.sequence_order).collect();
    assert_eq!(orders, vec![1, 2, 3]);
    let templates: Vec<Option<i64>> = package.components.iter().map(|c| c.template_id).collect();
    assert_eq!(
        templates,
        vec![
            Some(h.templates.declaration.id),
            Some(h.templates.policy_form.id),
            Some(h.templates.ca_notice.id)
        ]
    );
    assert!(package
        .components
        .iter()
        .all(|c| c.status == ComponentStatus::Generated && c.artifact_url.is_some()));
    assert_eq!(package.components[1].page_count, 2);

    let pages: i32 = package.components.iter().map(|c| c.page_count).sum();
    let bytes: i64 = package.components.iter().map(|c| c.byte_size).sum();
    assert_eq!(package.total_pages, pages);
    assert_eq!(package.byte_size, bytes);

    let combined = h.state.packages.combine_package(package.id).await.unwrap();
    assert!(!combined.degraded);
    assert_eq!(combined.page_count, pages);
    let key = combined.artifact_key.unwrap();
    assert!(key.starts_with("policy-packages/"));
    assert!(h.store.get(&key).await.unwrap().starts_with(b"%PDF"));

    let stored = h.repo.get_package(package.id).await.unwrap().unwrap();
    assert_eq!(stored.combined_artifact_key.as_deref(), Some(key.as_str()));
}

#[tokio::test]
async fn existing_package_is_returned_without_force() {
    let h = harness().await;
    let first = h.state.packages.create_package(WCP_POLICY, false).await.unwrap();
    let second = h.state.packages.create_package(WCP_POLICY, false).await.unwrap();
    assert!(!second.created);
    assert_eq!(second.package.id, first.package.id);
    assert_eq!(h.repo.list_packages(WCP_POLICY).await.unwrap().len(), 1);
}

#[tokio::test]
async fn broken_static_file_only_fails_its_component() {
    let h = harness().await;
    let package = h.state.packages.create_package(WCP_POLICY, false).await.unwrap().package;
    let before = package.components.clone();

    h.store.delete(POLICY_FORM_KEY).await.unwrap();
    let failed = h
        .state
        .packages
        .regenerate_component(WCP_POLICY, before[1].id)
        .await
        .unwrap();
    assert_eq!(failed.status, ComponentStatus::Error);
    assert!(failed
        .error_message
        .as_deref()
        .unwrap()
        .contains("missing_template_file"));

    let report = h.state.packages.get_status(WCP_POLICY).await.unwrap();
    let after = report.package.unwrap();
    assert_eq!(after.status, PackageStatus::Draft);
    assert_eq!(after.components[0], before[0]);
    assert_eq!(after.components[2], before[2]);
    assert_eq!(after.total_pages, before[0].page_count + before[2].page_count);

    // errored components are left out of the merge
    let combined = h.state.packages.combine_package(after.id).await.unwrap();
    assert!(!combined.degraded);
    assert_eq!(combined.page_count, after.total_pages);
}

#[tokio::test]
async fn generate_missing_repairs_errors_and_is_then_a_no_op() {
    let h = harness().await;
    let package = h.state.packages.create_package(WCP_POLICY, false).await.unwrap().package;

    let idle = h.state.packages.generate_missing(WCP_POLICY).await.unwrap();
    assert_eq!((idle.generated_count, idle.total_count), (0, 0));
    assert_eq!(idle.package_status, PackageStatus::Generated);

    h.store.delete(POLICY_FORM_KEY).await.unwrap();
    h.state
        .packages
        .regenerate_component(WCP_POLICY, package.components[1].id)
        .await
        .unwrap();

    h.store.put(POLICY_FORM_KEY, &common::blank_pdf(2)).await.unwrap();
    let repaired = h.state.packages.generate_missing(WCP_POLICY).await.unwrap();
    assert_eq!((repaired.generated_count, repaired.total_count), (1, 1));
    assert_eq!(repaired.results[0].component_id, package.components[1].id);
    assert_eq!(repaired.package_status, PackageStatus::Generated);
}

#[tokio::test]
async fn generate_missing_creates_a_package_when_there_is_none() {
    let h = harness().await;
    let summary = h.state.packages.generate_missing(NY_POLICY).await.unwrap();
    assert_eq!(summary.total_count, 2);
    assert_eq!(summary.generated_count, 2);
    assert_eq!(summary.package_status, PackageStatus::Generated);
}

#[tokio::test]
async fn dynamic_regeneration_is_byte_identical() {
    let h = harness().await;
    let package = h.state.packages.create_package(WCP_POLICY, false).await.unwrap().package;
    let declaration = &package.components[0];
    let first = h
        .store
        .get(declaration.artifact_key.as_deref().unwrap())
        .await
        .unwrap();

    let again = h
        .state
        .packages
        .regenerate_component(WCP_POLICY, declaration.id)
        .await
        .unwrap();
    assert_ne!(again.artifact_key, declaration.artifact_key);
    let second = h.store.get(again.artifact_key.as_deref().unwrap()).await.unwrap();
    assert_eq!(first, second);

    // the replaced artifact is gone
    assert!(!h
        .store
        .exists(declaration.artifact_key.as_deref().unwrap())
        .await
        .unwrap());
}

#[tokio::test]
async fn reissue_supersedes_the_previous_package() {
    let h = harness().await;
    let original = h.state.packages.create_package(WCP_POLICY, false).await.unwrap().package;

    let reissued = h.state.packages.create_package(WCP_POLICY, true).await.unwrap();
    assert!(reissued.created);
    let reissued = reissued.package;
    assert_eq!(reissued.number, "POL-WCP-000001-00-DOC-01");
    assert_eq!(reissued.version, 1);
    assert_eq!(reissued.status, PackageStatus::Generated);
    assert_eq!(reissued.components.len(), 3);
    assert!(reissued
        .components
        .iter()
        .all(|c| !original.components.iter().any(|o| o.id == c.id)));

    let old = h.repo.get_package(original.id).await.unwrap().unwrap();
    assert_eq!(old.status, PackageStatus::Reissued);
    assert!(!old.is_current);

    let third = h.state.packages.create_package(WCP_POLICY, true).await.unwrap().package;
    assert_eq!(third.number, "POL-WCP-000001-00-DOC-02");

    let packages = h.repo.list_packages(WCP_POLICY).await.unwrap();
    assert_eq!(packages.iter().filter(|p| p.is_current).count(), 1);
    let statuses: Vec<PackageStatus> = packages.iter().map(|p| p.status).collect();
    assert_eq!(
        statuses,
        vec![
            PackageStatus::Generated,
            PackageStatus::Reissued,
            PackageStatus::Superseded
        ]
    );
}

#[tokio::test]
async fn duplicate_template_gets_a_numbered_component() {
    let h = harness().await;
    let package = h.state.packages.create_package(WCP_POLICY, false).await.unwrap().package;
    let ai = h.templates.additional_insured.id;
    let custom = json!({"additional_insured_name": "Acme Realty"});

    let first = h
        .state
        .packages
        .add_component(WCP_POLICY, ai, Some(custom.clone()))
        .await
        .unwrap();
    assert_eq!(first.name, "Additional Insured");
    assert_eq!(first.sequence_order, 4);

    let second = h
        .state
        .packages
        .add_component(WCP_POLICY, ai, Some(custom))
        .await
        .unwrap();
    assert_eq!(second.name, "Additional Insured (2)");
    assert_eq!(second.sequence_order, 5);
    assert_eq!(second.component_type, TemplateType::Endorsement);
    assert_eq!(second.status, ComponentStatus::Generated);
    assert_ne!(first.artifact_key, second.artifact_key);

    let stored = h.repo.get_component(second.id).await.unwrap().unwrap();
    assert_eq!(
        stored.merge_inputs,
        json!({"custom": {"additional_insured_name": "Acme Realty"}})
    );

    let available = h
        .state
        .packages
        .list_available_templates(WCP_POLICY, Some(TemplateType::Endorsement), None)
        .await
        .unwrap();
    let usage: Vec<(String, i64)> = available
        .iter()
        .map(|t| (t.code.clone(), t.usage_count))
        .collect();
    assert_eq!(
        usage,
        vec![
            ("WCP-ADD-INSURED".to_string(), 2),
            ("WCP-WAIVER".to_string(), 0)
        ]
    );

    let refreshed = h.repo.get_package(package.id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, PackageStatus::Generated);
}

#[tokio::test]
async fn snapshot_survives_component_changes() {
    let h = harness().await;
    let package = h.state.packages.create_package(WCP_POLICY, false).await.unwrap().package;
    let snapshot = h.repo.get_package(package.id).await.unwrap().unwrap().merge_snapshot;

    h.state
        .packages
        .add_component(WCP_POLICY, h.templates.waiver.id, Some(json!({"waiver_party": "Port of Long Beach"})))
        .await
        .unwrap();
    h.state
        .packages
        .regenerate_component(WCP_POLICY, package.components[0].id)
        .await
        .unwrap();

    let after = h.repo.get_package(package.id).await.unwrap().unwrap().merge_snapshot;
    assert_eq!(
        serde_json::to_vec(&after).unwrap(),
        serde_json::to_vec(&snapshot).unwrap()
    );
    assert!(after.get("template").is_none());
    assert!(after.get("custom").is_none());
}

#[tokio::test]
async fn add_component_rejects_unusable_input() {
    let h = harness().await;
    h.state.packages.create_package(WCP_POLICY, false).await.unwrap();

    let err = h
        .state
        .packages
        .add_component(WCP_POLICY, h.templates.gen_ca_notice.id, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    let err = h
        .state
        .packages
        .add_component(WCP_POLICY, h.templates.waiver.id, Some(json!(["not", "a", "map"])))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    // no current package yet
    let err = h
        .state
        .packages
        .add_component(NY_POLICY, h.templates.waiver.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, pdae::error::EngineError::NotFound(_)));
}

#[tokio::test]
async fn deleting_a_component_removes_its_artifact() {
    let h = harness().await;
    let package = h.state.packages.create_package(WCP_POLICY, false).await.unwrap().package;
    let notice = &package.components[2];
    let key = notice.artifact_key.clone().unwrap();

    h.state.packages.delete_component(WCP_POLICY, notice.id).await.unwrap();
    assert!(!h.store.exists(&key).await.unwrap());
    assert!(h.repo.get_component(notice.id).await.unwrap().is_none());

    let after = h.repo.get_package(package.id).await.unwrap().unwrap();
    assert_eq!(
        after.total_pages,
        package.components[0].page_count + package.components[1].page_count
    );

    let err = h
        .state
        .packages
        .delete_component(NY_POLICY, package.components[0].id)
        .await
        .unwrap_err();
    assert!(matches!(err, pdae::error::EngineError::NotFound(_)));
}

#[tokio::test]
async fn state_without_mandatory_forms_gives_an_empty_draft() {
    let h = harness().await;
    let result = h.state.packages.create_package(GEN_POLICY, false).await.unwrap();
    assert!(result.created);
    assert!(result.package.components.is_empty());
    assert_eq!(result.package.status, PackageStatus::Draft);
    assert_eq!(result.package.number, "POL-GEN-000001-00-DOC");

    let combined = h.state.packages.combine_package(result.package.id).await.unwrap();
    assert!(combined.artifact_key.is_none());
    assert_eq!(combined.page_count, 0);
}

#[tokio::test]
async fn non_mandatory_templates_apply_in_every_state() {
    let h = harness().await;
    let package = h.state.packages.create_package(NY_POLICY, false).await.unwrap().package;
    let names: Vec<&str> = package.components.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["Declarations Page", "Workers Compensation Policy Form"]);
}

#[tokio::test]
async fn degraded_combine_writes_a_labeled_cover() {
    let h = harness_with(false).await;
    let package = h.state.packages.create_package(WCP_POLICY, false).await.unwrap().package;

    let combined = h.state.packages.combine_package(package.id).await.unwrap();
    assert!(combined.degraded);
    assert_eq!(combined.page_count, 1);
    let key = combined.artifact_key.unwrap();
    assert!(key.starts_with("combined/POL-WCP-000001-00-DOC-fallback-"));
    let bytes = h.store.get(&key).await.unwrap();
    assert_eq!(pdae::render::pdf::page_count(&bytes), Some(1));

    let stored = h.repo.get_package(package.id).await.unwrap().unwrap();
    assert!(stored.combined_artifact_key.is_none());
}

#[tokio::test]
async fn issued_packages_are_protected() {
    let h = harness().await;
    let package = h.state.packages.create_package(WCP_POLICY, false).await.unwrap().package;

    let issued = h.state.packages.issue_package(package.id).await.unwrap();
    assert_eq!(issued.status, PackageStatus::Issued);
    assert!(issued.issued_date.is_some());

    let err = h.state.packages.issue_package(package.id).await.unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    let err = h
        .state
        .packages
        .delete_component(WCP_POLICY, package.components[0].id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    let old_key = package.components[0].artifact_key.clone().unwrap();
    let err = h
        .state
        .packages
        .regenerate_component(WCP_POLICY, package.components[0].id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");
    assert!(h.store.exists(&old_key).await.unwrap());
    let stored = h.repo.get_component(package.components[0].id).await.unwrap().unwrap();
    assert_eq!(stored.artifact_key.as_deref(), Some(old_key.as_str()));

    let err = h
        .state
        .packages
        .add_component(WCP_POLICY, h.templates.additional_insured.id, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    let after = h.repo.get_package(package.id).await.unwrap().unwrap();
    assert_eq!(after.status, PackageStatus::Issued);
    assert_eq!(h.repo.list_components(package.id).await.unwrap().len(), 3);

    let newer = h.state.packages.create_package(WCP_POLICY, true).await.unwrap().package;
    let err = h.state.packages.issue_package(package.id).await.unwrap_err();
    assert!(err.to_string().contains("not the current package"));
    assert_eq!(newer.version, 1);
}

#[tokio::test]
async fn reissued_packages_keep_their_issued_artifacts() {
    let h = harness().await;
    let package = h.state.packages.create_package(WCP_POLICY, false).await.unwrap().package;
    h.state.packages.issue_package(package.id).await.unwrap();
    h.state.packages.create_package(WCP_POLICY, true).await.unwrap();

    let old = h.repo.get_package(package.id).await.unwrap().unwrap();
    assert_eq!(old.status, PackageStatus::Reissued);
    assert!(old.issued_date.is_some());

    for component in &package.components {
        let err = h
            .state
            .packages
            .regenerate_component(WCP_POLICY, component.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        let err = h
            .state
            .packages
            .delete_component(WCP_POLICY, component.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        let key = component.artifact_key.as_deref().unwrap();
        assert!(h.store.exists(key).await.unwrap());
    }
    assert_eq!(h.repo.list_components(package.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn superseded_packages_are_read_only_even_when_never_issued() {
    let h = harness().await;
    let first = h.state.packages.create_package(WCP_POLICY, false).await.unwrap().package;
    h.state.packages.create_package(WCP_POLICY, true).await.unwrap();

    let declaration = &first.components[0];
    let err = h
        .state
        .packages
        .regenerate_component(WCP_POLICY, declaration.id)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("can no longer be changed"));
    assert!(h
        .store
        .exists(declaration.artifact_key.as_deref().unwrap())
        .await
        .unwrap());
}

#[tokio::test]
async fn component_changes_invalidate_the_combined_artifact() {
    let h = harness().await;
    let package = h.state.packages.create_package(WCP_POLICY, false).await.unwrap().package;
    let combined = h.state.packages.combine_package(package.id).await.unwrap();
    assert_eq!(combined.page_count, package.total_pages);
    let stale_key = combined.artifact_key.unwrap();

    h.state
        .packages
        .add_component(
            WCP_POLICY,
            h.templates.additional_insured.id,
            Some(json!({"additional_insured_name": "Acme Realty"})),
        )
        .await
        .unwrap();
    let after_add = h.repo.get_package(package.id).await.unwrap().unwrap();
    assert!(after_add.combined_artifact_key.is_none());
    assert!(after_add.total_pages > package.total_pages);

    h.state
        .packages
        .deliver_package(WCP_POLICY, &["ops@harborfreight.example".to_string()])
        .await
        .unwrap();
    let delivered = h.repo.get_package(package.id).await.unwrap().unwrap();
    let key = delivered.combined_artifact_key.clone().unwrap();
    assert_ne!(key, stale_key);

    let requests = h.delivery.requests.lock().clone();
    assert_eq!(requests[0].artifact_urls, vec![h.store.url(&key)]);
    let bytes = h.store.get(&key).await.unwrap();
    assert_eq!(pdae::render::pdf::page_count(&bytes), Some(delivered.total_pages));

    // deleting and regenerating drop the combined reference the same way
    let combined = h.state.packages.combine_package(package.id).await.unwrap();
    assert!(combined.artifact_key.is_some());
    h.state
        .packages
        .delete_component(WCP_POLICY, package.components[2].id)
        .await
        .unwrap();
    let after_delete = h.repo.get_package(package.id).await.unwrap().unwrap();
    assert!(after_delete.combined_artifact_key.is_none());

    h.state.packages.combine_package(package.id).await.unwrap();
    h.state
        .packages
        .regenerate_component(WCP_POLICY, package.components[0].id)
        .await
        .unwrap();
    let after_regenerate = h.repo.get_package(package.id).await.unwrap().unwrap();
    assert!(after_regenerate.combined_artifact_key.is_none());
}

#[tokio::test]
async fn concurrent_creates_leave_one_current_package() {
    let h = harness().await;
    let (a, b) = tokio::join!(
        h.state.packages.create_package(WCP_POLICY, false),
        h.state.packages.create_package(WCP_POLICY, false),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.package.id, b.package.id);
    assert_eq!(a.package.number, "POL-WCP-000001-00-DOC");
    assert!(a.created ^ b.created);

    let packages = h.repo.list_packages(WCP_POLICY).await.unwrap();
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].version, 0);
}

#[tokio::test]
async fn repository_keeps_an_existing_current_package_unless_replacing() {
    let h = harness().await;
    let new_package = || NewPackage {
        policy_id: WCP_POLICY,
        policy_number: "POL-WCP-000001-00".to_string(),
        state_code: "CA".to_string(),
        merge_snapshot: json!({}),
    };
    let components = || vec![NewComponent::from_template(&h.templates.declaration)];

    let first = h.repo.create_package(new_package(), components(), false).await.unwrap();
    assert!(first.created);

    let kept = h.repo.create_package(new_package(), components(), false).await.unwrap();
    assert!(!kept.created);
    assert_eq!(kept.package.id, first.package.id);
    assert_eq!(kept.components, first.components);

    let replaced = h.repo.create_package(new_package(), components(), true).await.unwrap();
    assert!(replaced.created);
    assert_eq!(replaced.package.version, 1);
    assert_eq!(h.repo.list_packages(WCP_POLICY).await.unwrap().len(), 2);
}

#[tokio::test]
async fn package_versions_stop_at_two_digits() {
    let h = harness().await;
    let new_package = || NewPackage {
        policy_id: WCP_POLICY,
        policy_number: "POL-WCP-000001-00".to_string(),
        state_code: "CA".to_string(),
        merge_snapshot: json!({}),
    };
    for _ in 0..100 {
        h.repo.create_package(new_package(), Vec::new(), true).await.unwrap();
    }
    let current = h.repo.get_current_package(WCP_POLICY).await.unwrap().unwrap();
    assert_eq!(current.number, "POL-WCP-000001-00-DOC-99");

    let err = h
        .repo
        .create_package(new_package(), Vec::new(), true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    let still = h.repo.get_current_package(WCP_POLICY).await.unwrap().unwrap();
    assert_eq!(still.id, current.id);
    assert_eq!(h.repo.list_packages(WCP_POLICY).await.unwrap().len(), 100);
}

#[tokio::test]
async fn bulk_generation_reports_each_policy_in_order() {
    let h = harness().await;
    let results = h
        .state
        .packages
        .bulk_generate(&[WCP_POLICY, 999, GEN_POLICY], BulkMode::Missing)
        .await;

    let ids: Vec<i64> = results.iter().map(|r| r.policy_id).collect();
    assert_eq!(ids, vec![WCP_POLICY, 999, GEN_POLICY]);

    assert!(results[0].success);
    assert_eq!(results[0].package_number.as_deref(), Some("POL-WCP-000001-00-DOC"));
    assert_eq!((results[0].generated_count, results[0].total_count), (3, 3));

    assert!(!results[1].success);
    assert_eq!(results[1].error_kind.as_deref(), Some("validation_error"));

    assert!(results[2].success);
    assert_eq!(results[2].package_status, Some(PackageStatus::Draft));
    assert_eq!(results[2].total_count, 0);

    let fresh = h.state.packages.bulk_generate(&[WCP_POLICY], BulkMode::All).await;
    assert_eq!(fresh[0].package_number.as_deref(), Some("POL-WCP-000001-00-DOC-01"));

    let rerun = h
        .state
        .packages
        .bulk_generate(&[WCP_POLICY, NY_POLICY], BulkMode::Regenerate)
        .await;
    assert_eq!((rerun[0].generated_count, rerun[0].total_count), (3, 3));
    assert!(rerun[1].success);
    assert!(rerun[1].package_number.is_none());
}

#[tokio::test]
async fn delivery_hands_off_the_combined_package() {
    let h = harness().await;
    h.state.packages.create_package(WCP_POLICY, false).await.unwrap();

    let receipt = h
        .state
        .packages
        .deliver_package(WCP_POLICY, &[" ops@harborfreight.example ".to_string()])
        .await
        .unwrap();
    assert_eq!(receipt.channel, "recording");
    assert_eq!(receipt.recipients, vec!["ops@harborfreight.example".to_string()]);
    assert_eq!(receipt.artifact_urls.len(), 1);
    assert!(receipt.artifact_urls[0].contains("policy-packages/"));

    let requests = h.delivery.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].combined);
    assert_eq!(requests[0].policy_number, "POL-WCP-000001-00");

    h.state.packages.create_package(GEN_POLICY, false).await.unwrap();
    let err = h
        .state
        .packages
        .deliver_package(GEN_POLICY, &["ops@harborfreight.example".to_string()])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    let err = h
        .state
        .packages
        .deliver_package(WCP_POLICY, &["not-an-address".to_string()])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");
}

#[tokio::test]
async fn degraded_delivery_falls_back_to_component_links() {
    let h = harness_with(false).await;
    h.state.packages.create_package(WCP_POLICY, false).await.unwrap();
    let receipt = h
        .state
        .packages
        .deliver_package(WCP_POLICY, &["ops@harborfreight.example".to_string()])
        .await
        .unwrap();
    assert_eq!(receipt.artifact_urls.len(), 3);
    assert!(!h.delivery.requests.lock()[0].combined);
}

#[tokio::test]
async fn concurrent_regeneration_of_one_component_is_refused() {
    let h = harness().await;
    let package = h.state.packages.create_package(WCP_POLICY, false).await.unwrap().package;
    let component = package.components[0].id;

    let _held = h.state.packages.locks().try_acquire(component).unwrap();
    let err = h
        .state
        .packages
        .regenerate_component(WCP_POLICY, component)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "concurrency");
}
