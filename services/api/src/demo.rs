use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use clap::Args;
use loyalty::clock::{Clock, ManualClock};
use loyalty::config::PipelineConfig;
use loyalty::error::AppError;
use loyalty::notify::LogNotifier;
use loyalty::storage::InMemoryRepository;
use loyalty::workflows::receipts::{
    Collaborators, CustomerPhone, ExtractionResult, FraudAssessment, PresetExtractor,
    PresetFraudScorer, ReceiptId, ReceiptImage, ReceiptOutcome, ReceiptService, ReceiptUpload,
    ReviewRequest, Reviewer, StoreId, StoreReceiptConfig,
};
use loyalty::workflows::rewards::{RewardRule, RewardService, StaffMember};

const DEMO_STORE: &str = "store-harbor-cafe";
const DEMO_TIN: &str = "TIN-4410-2291";

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Customer phone used for the walkthrough
    #[arg(long, default_value = "+15550123")]
    pub(crate) phone: String,
    /// Visits required in the period before the store issues a reward
    #[arg(long, default_value_t = 3)]
    pub(crate) visits_needed: u32,
    /// Skip the manual review portion of the demo
    #[arg(long)]
    pub(crate) skip_review: bool,
}

struct Demo {
    receipts: ReceiptService<InMemoryRepository, LogNotifier>,
    rewards: RewardService<InMemoryRepository, LogNotifier>,
    extractor: Arc<PresetExtractor>,
    scorer: Arc<PresetFraudScorer>,
    clock: Arc<ManualClock>,
    phone: CustomerPhone,
}

impl Demo {
    fn new(phone: &str, visits_needed: u32) -> Self {
        let store_id = StoreId(DEMO_STORE.to_string());
        let repository = Arc::new(InMemoryRepository::new().with_store(
            StoreReceiptConfig {
                store_id: store_id.clone(),
                name: "Harbor Cafe".to_string(),
                tin: DEMO_TIN.to_string(),
                branch_name: Some("Pier 4".to_string()),
                min_receipt_amount: 8.0,
                receipt_validity_hours: 48,
                uploads_enabled: true,
            },
            Some(RewardRule {
                description: "Free drink of your choice".to_string(),
                ..RewardRule::fallback(store_id, visits_needed)
            }),
        ));
        let extractor = Arc::new(PresetExtractor::new());
        let scorer = Arc::new(PresetFraudScorer::new(FraudAssessment::default()));
        let start = Utc
            .with_ymd_and_hms(2025, 5, 5, 9, 30, 0)
            .single()
            .unwrap_or_else(Utc::now);
        let clock = Arc::new(ManualClock::new(start));
        let notifier = Arc::new(LogNotifier);
        let config = PipelineConfig::default();

        let receipts = ReceiptService::new(
            repository.clone(),
            notifier.clone(),
            Collaborators {
                extractor: extractor.clone(),
                scorer: scorer.clone(),
            },
            &config,
        )
        .with_clock(clock.clone());
        let rewards =
            RewardService::new(repository, notifier, config.accrual).with_clock(clock.clone());

        Self {
            receipts,
            rewards,
            extractor,
            scorer,
            clock,
            phone: CustomerPhone::normalized(phone),
        }
    }

    /// Scripts what the collaborators will say about the next photo.
    fn stage(&self, receipt_id: &str, total: f64, fraud_score: u8) -> ReceiptUpload {
        let reference = format!("receipts/{receipt_id}");
        let now = self.clock.now();
        self.extractor.insert(
            reference.clone(),
            ExtractionResult {
                raw_text: format!("HARBOR CAFE PIER 4 {DEMO_TIN} #{receipt_id}"),
                tax_id: Some(DEMO_TIN.to_string()),
                invoice_number: Some(format!("HC-{receipt_id}")),
                branch_text: Some("Harbor Cafe - Pier 4".to_string()),
                date: Some(now - Duration::hours(1)),
                total_amount: Some(total),
                barcode: None,
                image_hash: Some(format!("img-{receipt_id}")),
            },
        );
        self.scorer.insert(
            reference.clone(),
            FraudAssessment {
                overall: fraud_score,
                ..FraudAssessment::default()
            },
        );

        ReceiptUpload {
            receipt_id: Some(ReceiptId(receipt_id.to_string())),
            customer_phone: self.phone.clone(),
            customer_name: Some("Demo Customer".to_string()),
            store_id: Some(StoreId(DEMO_STORE.to_string())),
            image: ReceiptImage {
                reference,
                content_type: "image/jpeg".to_string(),
                bytes: vec![0xFF, 0xD8, 0xFF],
            },
        }
    }
}

fn render_outcome(label: &str, outcome: &ReceiptOutcome) {
    println!(
        "- {label}: receipt {} -> {} ({})",
        outcome.receipt_id, outcome.status, outcome.reason
    );
    if let Some(details) = &outcome.rejection_details {
        for failure in details {
            println!("    failed check: {failure}");
        }
    }
    if let (Some(in_period), Some(needed)) = (outcome.visits_in_period, outcome.visits_needed) {
        println!(
            "    visits this period: {in_period}/{needed} | lifetime visits: {}",
            outcome.visit_count.unwrap_or_default()
        );
    }
    if let Some(code) = &outcome.reward_code {
        println!("    reward earned! code {code}");
    }
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs {
        phone,
        visits_needed,
        skip_review,
    } = args;

    let demo = Demo::new(&phone, visits_needed.max(1));
    println!("Receipt verification demo for customer {}", demo.phone);

    let mut sequence = 0;
    let mut next_id = || {
        sequence += 1;
        format!("demo-{sequence:03}")
    };

    let upload = demo.stage(&next_id(), 14.5, 8);
    match demo.receipts.submit(upload).await {
        Ok(outcome) => render_outcome("Clean receipt", &outcome),
        Err(err) => println!("- Clean receipt failed: {err}"),
    }

    demo.clock.advance(Duration::days(1));
    let upload = demo.stage(&next_id(), 3.75, 8);
    match demo.receipts.submit(upload).await {
        Ok(outcome) => render_outcome("Small purchase", &outcome),
        Err(err) => println!("- Small purchase failed: {err}"),
    }

    let resubmitted = demo.stage("demo-001", 14.5, 8);
    match demo.receipts.submit(resubmitted).await {
        Ok(outcome) => render_outcome("Resubmitted receipt", &outcome),
        Err(err) => println!("- Resubmitted receipt refused: {err}"),
    }

    if !skip_review {
        demo.clock.advance(Duration::days(1));
        let receipt_id = next_id();
        let upload = demo.stage(&receipt_id, 22.0, 55);
        match demo.receipts.submit(upload).await {
            Ok(outcome) => render_outcome("Blurry photo", &outcome),
            Err(err) => println!("- Blurry photo failed: {err}"),
        }

        let receipt_id = ReceiptId(receipt_id);
        if let Err(err) = demo.receipts.request_manual_review(&receipt_id, &demo.phone) {
            println!("  Escalation failed: {err}");
        }
        let reviewer = Reviewer::store_admin("harbor-manager", StoreId(DEMO_STORE.to_string()));
        match demo.receipts.review_detail(&receipt_id, &reviewer) {
            Ok(detail) => {
                let comparison = detail.comparison;
                println!(
                    "  Reviewer sees fraud score {} | tax id match: {}",
                    detail.fraud.map(|fraud| fraud.overall).unwrap_or_default(),
                    comparison.map(|view| view.tin_matches).unwrap_or(false)
                );
            }
            Err(err) => println!("  Review detail unavailable: {err}"),
        }
        let request = ReviewRequest {
            notes: Some("stamp and total legible on zoom".to_string()),
            ..ReviewRequest::approve()
        };
        match demo.receipts.review(&receipt_id, &reviewer, request) {
            Ok(outcome) => render_outcome("Manual review", &outcome),
            Err(err) => println!("  Manual review failed: {err}"),
        }
    }

    let mut reward = None;
    for _ in 0..visits_needed.max(1) {
        demo.clock.advance(Duration::days(2));
        let upload = demo.stage(&next_id(), 18.0, 4);
        match demo.receipts.submit(upload).await {
            Ok(outcome) => {
                render_outcome("Regular visit", &outcome);
                if outcome.reward_id.is_some() {
                    reward = outcome.reward_id;
                    break;
                }
            }
            Err(err) => {
                println!("- Regular visit failed: {err}");
                return Ok(());
            }
        }
    }

    if let Ok(progress) = demo
        .rewards
        .eligibility(&demo.phone, &StoreId(DEMO_STORE.to_string()))
    {
        println!(
            "\nProgress toward the next reward: {}/{}",
            progress.visits_in_period, progress.visits_needed
        );
    }

    let Some(reward_id) = reward else {
        println!("No reward issued during the walkthrough.");
        return Ok(());
    };

    println!("\nReward lifecycle");
    match demo.rewards.redeem(&reward_id, &demo.phone) {
        Ok(reward) => println!("- Redeemed {} at the counter ({})", reward.code, reward.status),
        Err(err) => {
            println!("- Redeem failed: {err}");
            return Ok(());
        }
    }
    let staff = StaffMember {
        id: "barista-1".to_string(),
        store_id: StoreId(DEMO_STORE.to_string()),
    };
    match demo.rewards.mark_used(&reward_id, &staff) {
        Ok(reward) => println!(
            "- Staff {} confirmed use: {} ({})",
            staff.id, reward.description, reward.status
        ),
        Err(err) => println!("- Mark used failed: {err}"),
    }

    Ok(())
}
