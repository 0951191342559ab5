#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use pdae::config::EngineConfig;
use pdae::db::{MemoryRepository, Repository};
use pdae::delivery::{DeliveryChannel, DeliveryRequest};
use pdae::error::EngineError;
use pdae::models::{
    ApplicationRecord, Coverage, Insured, NewTemplate, PolicyRecord, Product, QuoteRecord,
    Template, TemplateFormat, TemplateType,
};
use pdae::render::layout::Page;
use pdae::render::pdf;
use pdae::storage::{ArtifactStore, MemoryArtifactStore};
use pdae::AppState;

pub const WCP_POLICY: i64 = 1;
pub const NY_POLICY: i64 = 2;
pub const GEN_POLICY: i64 = 3;

pub const POLICY_FORM_KEY: &str = "templates/WCP-FORM-001/form.pdf";

/// Delivery channel that remembers every hand-off.
#[derive(Default)]
pub struct RecordingChannel {
    pub requests: Mutex<Vec<DeliveryRequest>>,
}

#[async_trait]
impl DeliveryChannel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, request: &DeliveryRequest) -> Result<(), EngineError> {
        self.requests.lock().push(request.clone());
        Ok(())
    }
}

pub struct Templates {
    pub declaration: Template,
    pub policy_form: Template,
    pub ca_notice: Template,
    pub additional_insured: Template,
    pub waiver: Template,
    pub gen_ca_notice: Template,
}

pub struct Harness {
    pub repo: Arc<MemoryRepository>,
    pub store: Arc<MemoryArtifactStore>,
    pub delivery: Arc<RecordingChannel>,
    pub state: AppState,
    pub templates: Templates,
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// A blank PDF with `pages` pages.
pub fn blank_pdf(pages: usize) -> Vec<u8> {
    pdf::write_pages(&vec![Page::default(); pages]).unwrap()
}

pub fn policy(id: i64, product: &str, base: &str, state: &str) -> PolicyRecord {
    PolicyRecord {
        id,
        number: format!("POL-{product}-{base}-00"),
        product_code: product.to_string(),
        base_number: base.to_string(),
        sequence_number: 0,
        version_number: None,
        effective_date: date(2024, 6, 1),
        expiration_date: date(2025, 6, 1),
        state_code: state.to_string(),
        status: "active".to_string(),
        annual_premium: Decimal::new(1_250_000, 2),
        insured: Insured {
            company_name: "Harbor Freight Logistics LLC".to_string(),
            dba_name: Some("Harbor Freight".to_string()),
            address_line1: "1200 Terminal Way".to_string(),
            address_line2: Some("Suite 4".to_string()),
            city: "Long Beach".to_string(),
            state: state.to_string(),
            zip_code: "90802".to_string(),
        },
        quote: QuoteRecord {
            number: format!("QTE-{product}-{base}-00-01"),
            effective_date: date(2024, 6, 1),
            expiration_date: date(2025, 6, 1),
            total_premium: Decimal::new(1_250_000, 2),
        },
        application: ApplicationRecord {
            number: Some(format!("APP-{product}-{base}-00")),
            company_name: "Harbor Freight Logistics LLC".to_string(),
            product_name: "Workers Compensation".to_string(),
        },
        coverages: vec![
            Coverage {
                name: "Employers Liability".to_string(),
                limit: Decimal::new(100_000_000, 2),
                deductible: None,
                premium: Decimal::new(850_000, 2),
            },
            Coverage {
                name: "Statutory Workers Compensation".to_string(),
                limit: Decimal::new(50_000_000, 2),
                deductible: Some(Decimal::new(250_000, 2)),
                premium: Decimal::new(400_000, 2),
            },
        ],
    }
}

fn new_template(
    code: &str,
    name: &str,
    template_type: TemplateType,
    format: TemplateFormat,
    product: Option<&str>,
    sequence: i32,
) -> NewTemplate {
    NewTemplate {
        code: code.to_string(),
        name: name.to_string(),
        template_type,
        format,
        product_code: product.map(str::to_string),
        applicable_states: vec![],
        state_mandatory: false,
        storage_key: None,
        inline_layout: None,
        merge_fields: BTreeMap::new(),
        version: "1.0".to_string(),
        effective_date: date(2024, 1, 1),
        expiration_date: None,
        default_sequence: sequence,
        active: true,
    }
}

async fn insert(repo: &MemoryRepository, template: NewTemplate) -> Template {
    repo.insert_template_if_absent(template).await.unwrap().0
}

/// Seed products, templates and policies into fresh in-memory backends.
///
/// WCP gets a dynamic declaration (10), a static two-page policy form (100)
/// and a California notice (300). Endorsement templates become effective
/// after the policies do, so package creation never picks them up.
pub async fn harness_with(combine_primary: bool) -> Harness {
    let repo = Arc::new(MemoryRepository::new());
    let store = Arc::new(MemoryArtifactStore::new());
    let delivery = Arc::new(RecordingChannel::default());

    for (code, name) in [("WCP", "Workers Compensation"), ("GEN", "General Liability")] {
        repo.upsert_product(&Product {
            code: code.to_string(),
            name: name.to_string(),
            active: true,
        })
        .await
        .unwrap();
    }

    store.put(POLICY_FORM_KEY, &blank_pdf(2)).await.unwrap();

    let declaration = insert(
        &repo,
        new_template(
            "WCP-DEC-001",
            "Declarations Page",
            TemplateType::Declaration,
            TemplateFormat::Dynamic,
            Some("WCP"),
            10,
        ),
    )
    .await;

    let mut form = new_template(
        "WCP-FORM-001",
        "Workers Compensation Policy Form",
        TemplateType::PolicyForm,
        TemplateFormat::Static,
        Some("WCP"),
        100,
    );
    form.storage_key = Some(POLICY_FORM_KEY.to_string());
    let policy_form = insert(&repo, form).await;

    let mut notice = new_template(
        "CA-NOTICE-001",
        "California Notice to Employees",
        TemplateType::StateForm,
        TemplateFormat::Dynamic,
        Some("WCP"),
        300,
    );
    notice.applicable_states = vec!["CA".to_string()];
    notice.state_mandatory = true;
    let ca_notice = insert(&repo, notice).await;

    let mut ai = new_template(
        "WCP-ADD-INSURED",
        "Additional Insured",
        TemplateType::Endorsement,
        TemplateFormat::Dynamic,
        Some("WCP"),
        500,
    );
    ai.effective_date = date(2025, 1, 1);
    let additional_insured = insert(&repo, ai).await;

    let mut waiver = new_template(
        "WCP-WAIVER",
        "Waiver of Subrogation",
        TemplateType::Endorsement,
        TemplateFormat::Dynamic,
        Some("WCP"),
        510,
    );
    waiver.effective_date = date(2025, 1, 1);
    let waiver = insert(&repo, waiver).await;

    let mut gen_notice = new_template(
        "GEN-CA-NOTICE",
        "California General Liability Notice",
        TemplateType::StateForm,
        TemplateFormat::Dynamic,
        Some("GEN"),
        300,
    );
    gen_notice.applicable_states = vec!["CA".to_string()];
    gen_notice.state_mandatory = true;
    let gen_ca_notice = insert(&repo, gen_notice).await;

    repo.insert_policy(policy(WCP_POLICY, "WCP", "000001", "CA"));
    repo.insert_policy(policy(NY_POLICY, "WCP", "000002", "NY"));
    repo.insert_policy(policy(GEN_POLICY, "GEN", "000001", "TX"));

    let config = EngineConfig {
        render_timeout: Duration::from_secs(10),
        combine_primary,
        bulk_concurrency: 2,
        ..EngineConfig::default()
    };
    let state = AppState::with_parts(config, repo.clone(), store.clone(), delivery.clone());

    Harness {
        repo,
        store,
        delivery,
        state,
        templates: Templates {
            declaration,
            policy_form,
            ca_notice,
            additional_insured,
            waiver,
            gen_ca_notice,
        },
    }
}

pub async fn harness() -> Harness {
    harness_with(true).await
}
