use chrono::{DateTime, Duration, Utc};

use super::super::domain::{ExtractionResult, StoreId, StoreReceiptConfig};
use super::{DuplicateMatches, FailureIssue, FieldFailure, ReceiptField, ValidationOutcome};

/// Shortest configured tax id eligible for approximate matching. Shorter ids must match exactly.
const FUZZY_MIN_LEN: usize = 6;

/// Clock skew allowed between the till that printed a receipt and this service.
const FUTURE_DATE_TOLERANCE_MINUTES: i64 = 60;

/// How a receipt got tied to a store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StoreResolution<'a> {
    Assigned(&'a StoreReceiptConfig),
    MatchedByTaxId(&'a StoreReceiptConfig),
    Unresolved,
}

impl<'a> StoreResolution<'a> {
    pub fn config(&self) -> Option<&'a StoreReceiptConfig> {
        match self {
            StoreResolution::Assigned(config) | StoreResolution::MatchedByTaxId(config) => {
                Some(config)
            }
            StoreResolution::Unresolved => None,
        }
    }
}

/// Case and whitespace folding used for the exact tax-id comparison.
pub fn normalize_tax_id(raw: &str) -> String {
    raw.chars()
        .filter(|ch| !ch.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

fn alphanumeric_key(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_uppercase())
        .collect()
}

/// Ties a receipt to a store: an explicit assignment wins, otherwise the extracted tax id is
/// matched against every upload-enabled store. Ambiguous matches stay unresolved.
pub fn resolve_store<'a>(
    assigned: Option<&StoreId>,
    tax_id: Option<&str>,
    stores: &'a [StoreReceiptConfig],
) -> StoreResolution<'a> {
    if let Some(store_id) = assigned {
        return stores
            .iter()
            .find(|config| &config.store_id == store_id)
            .map(StoreResolution::Assigned)
            .unwrap_or(StoreResolution::Unresolved);
    }

    let Some(found) = tax_id.map(alphanumeric_key).filter(|key| !key.is_empty()) else {
        return StoreResolution::Unresolved;
    };

    let mut best: Option<(u8, &StoreReceiptConfig)> = None;
    let mut tied = false;
    for config in stores.iter().filter(|config| config.uploads_enabled) {
        let Some(rank) = match_rank(&alphanumeric_key(&config.tin), &found) else {
            continue;
        };
        match best {
            Some((best_rank, _)) if rank > best_rank => {}
            Some((best_rank, _)) if rank == best_rank => tied = true,
            _ => {
                best = Some((rank, config));
                tied = false;
            }
        }
    }

    match best {
        Some((_, config)) if !tied => StoreResolution::MatchedByTaxId(config),
        _ => StoreResolution::Unresolved,
    }
}

/// Lower is better: 0 exact, 1 configured id embedded in OCR text, 2 a single-character misread.
fn match_rank(expected: &str, found: &str) -> Option<u8> {
    if expected.is_empty() {
        return None;
    }
    if expected == found {
        return Some(0);
    }
    if expected.len() < FUZZY_MIN_LEN {
        return None;
    }
    if found.contains(expected) {
        return Some(1);
    }
    if within_one_edit(expected, found) {
        return Some(2);
    }
    None
}

fn within_one_edit(a: &str, b: &str) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (short, long) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    if long.len() - short.len() > 1 {
        return false;
    }

    let (mut i, mut j, mut edits) = (0, 0, 0);
    while i < short.len() && j < long.len() {
        if short[i] == long[j] {
            i += 1;
            j += 1;
            continue;
        }
        edits += 1;
        if edits > 1 {
            return false;
        }
        if short.len() == long.len() {
            i += 1;
        }
        j += 1;
    }
    edits + (long.len() - j) + (short.len() - i) <= 1
}

/// Checks the extracted fields against the store rules and the global duplicate constraints.
/// With no store the identity, amount and window checks are skipped; duplicates always run.
pub fn validate(
    extraction: &ExtractionResult,
    store: Option<&StoreReceiptConfig>,
    duplicates: &DuplicateMatches,
    now: DateTime<Utc>,
) -> ValidationOutcome {
    let mut failures = Vec::new();

    match store {
        Some(config) => {
            check_tax_id(extraction, config, &mut failures);
            check_branch(extraction, config, &mut failures);
            check_amount(extraction, config, &mut failures);
            check_validity_window(extraction, config, now, &mut failures);
        }
        None => failures.push(FieldFailure {
            field: ReceiptField::Store,
            issue: FailureIssue::Unmatched,
            found: extraction.tax_id.clone(),
            expected: None,
            message: match &extraction.tax_id {
                Some(tax_id) => format!("no store matches tax id {tax_id}"),
                None => "store could not be determined from the receipt".to_string(),
            },
        }),
    }

    check_duplicates(extraction, duplicates, &mut failures);

    ValidationOutcome {
        passed: failures.is_empty(),
        store_resolved: store.is_some(),
        failures,
    }
}

fn check_tax_id(
    extraction: &ExtractionResult,
    config: &StoreReceiptConfig,
    failures: &mut Vec<FieldFailure>,
) {
    match extraction.tax_id.as_deref() {
        None => failures.push(FieldFailure {
            field: ReceiptField::TaxId,
            issue: FailureIssue::Missing,
            found: None,
            expected: Some(config.tin.clone()),
            message: "tax id not found on receipt".to_string(),
        }),
        Some(found) if normalize_tax_id(found) != normalize_tax_id(&config.tin) => {
            failures.push(FieldFailure {
                field: ReceiptField::TaxId,
                issue: FailureIssue::Mismatch,
                found: Some(found.to_string()),
                expected: Some(config.tin.clone()),
                message: format!(
                    "tax id {found} does not match store tax id {}",
                    config.tin
                ),
            })
        }
        Some(_) => {}
    }
}

fn check_branch(
    extraction: &ExtractionResult,
    config: &StoreReceiptConfig,
    failures: &mut Vec<FieldFailure>,
) {
    let (Some(found), Some(expected)) = (
        extraction.branch_text.as_deref(),
        config.branch_name.as_deref(),
    ) else {
        return;
    };
    if expected.trim().is_empty() {
        return;
    }
    if !found
        .to_lowercase()
        .contains(&expected.trim().to_lowercase())
    {
        failures.push(FieldFailure {
            field: ReceiptField::BranchName,
            issue: FailureIssue::Mismatch,
            found: Some(found.to_string()),
            expected: Some(expected.to_string()),
            message: format!("branch '{found}' does not mention '{expected}'"),
        });
    }
}

fn check_amount(
    extraction: &ExtractionResult,
    config: &StoreReceiptConfig,
    failures: &mut Vec<FieldFailure>,
) {
    if config.min_receipt_amount <= 0.0 {
        return;
    }
    match extraction.total_amount {
        None => failures.push(FieldFailure {
            field: ReceiptField::TotalAmount,
            issue: FailureIssue::Missing,
            found: None,
            expected: Some(format!("{:.2}", config.min_receipt_amount)),
            message: "total amount not found on receipt".to_string(),
        }),
        Some(total) if total < config.min_receipt_amount => failures.push(FieldFailure {
            field: ReceiptField::TotalAmount,
            issue: FailureIssue::BelowMinimum,
            found: Some(format!("{total:.2}")),
            expected: Some(format!("{:.2}", config.min_receipt_amount)),
            message: format!(
                "amount {total:.2} is below the minimum amount of {:.2}",
                config.min_receipt_amount
            ),
        }),
        Some(_) => {}
    }
}

/// Dated later than `now` by more than the allowed clock skew.
pub fn is_future_dated(date: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    date - now > Duration::minutes(FUTURE_DATE_TOLERANCE_MINUTES)
}

fn check_validity_window(
    extraction: &ExtractionResult,
    config: &StoreReceiptConfig,
    now: DateTime<Utc>,
    failures: &mut Vec<FieldFailure>,
) {
    let window = Duration::hours(i64::from(config.receipt_validity_hours));
    match extraction.date {
        None => failures.push(FieldFailure {
            field: ReceiptField::ReceiptDate,
            issue: FailureIssue::Missing,
            found: None,
            expected: Some(format!("within {} hours", config.receipt_validity_hours)),
            message: "receipt date not found".to_string(),
        }),
        Some(date) if is_future_dated(date, now) => {
            failures.push(FieldFailure {
                field: ReceiptField::ReceiptDate,
                issue: FailureIssue::FutureDated,
                found: Some(date.to_rfc3339()),
                expected: Some(format!("no later than {}", now.to_rfc3339())),
                message: "receipt is dated in the future".to_string(),
            })
        }
        Some(date) if now - date > window => failures.push(FieldFailure {
            field: ReceiptField::ReceiptDate,
            issue: FailureIssue::Expired,
            found: Some(date.to_rfc3339()),
            expected: Some(format!("within {} hours", config.receipt_validity_hours)),
            message: format!(
                "receipt is older than the {} hour validity window",
                config.receipt_validity_hours
            ),
        }),
        Some(_) => {}
    }
}

fn check_duplicates(
    extraction: &ExtractionResult,
    duplicates: &DuplicateMatches,
    failures: &mut Vec<FieldFailure>,
) {
    let checks = [
        (
            ReceiptField::InvoiceNumber,
            extraction.invoice_number.as_ref(),
            duplicates.invoice_number.as_ref(),
            "invoice number",
        ),
        (
            ReceiptField::Barcode,
            extraction.barcode.as_ref(),
            duplicates.barcode.as_ref(),
            "barcode",
        ),
        (
            ReceiptField::ImageHash,
            extraction.image_hash.as_ref(),
            duplicates.image_hash.as_ref(),
            "receipt image",
        ),
    ];

    for (field, value, earlier, label) in checks {
        if let (Some(value), Some(earlier)) = (value, earlier) {
            failures.push(FieldFailure {
                field,
                issue: FailureIssue::Duplicate,
                found: Some(value.clone()),
                expected: None,
                message: format!("{label} was already submitted with receipt {earlier}"),
            });
        }
    }
}
