//! Natural-key upserts of normalized records.
//!
//! Every function works inside the caller's transaction and never commits.
//! Entities are merged with "enrich, don't erase" semantics (only non-empty
//! incoming fields overwrite). Child records are append-only: an existing
//! (owner, child key) pair is left untouched, a new one is inserted.

use crate::error::AppError;
use crate::models::LabelPatch;
use crate::normalize::{ConditionRecord, DrugRecord};
use crate::sync::RecordOutcome;
use crate::traits::EntityTx;

/// Upserts one drug and appends its missing ingredients.
pub async fn upsert_drug<T: EntityTx>(
    tx: &mut T,
    record: &DrugRecord,
) -> Result<RecordOutcome, AppError> {
    let outcome = match tx.find_drug(&record.patch.ndc).await? {
        Some(_) => {
            tx.update_drug(&record.patch).await?;
            RecordOutcome::Updated
        }
        None => {
            tx.insert_drug(&record.patch).await?;
            RecordOutcome::Imported
        }
    };

    for ingredient in &record.ingredients {
        tx.insert_ingredient(ingredient).await?;
    }

    Ok(outcome)
}

/// Upserts one diagnosis and appends its missing synonyms.
pub async fn upsert_condition<T: EntityTx>(
    tx: &mut T,
    record: &ConditionRecord,
) -> Result<RecordOutcome, AppError> {
    let patch = &record.patch;
    let (diagnosis_id, outcome) = match tx
        .find_diagnosis(&patch.condition_name, &patch.icd10_code)
        .await?
    {
        Some(existing) => {
            tx.update_diagnosis(existing.id, patch).await?;
            (existing.id, RecordOutcome::Updated)
        }
        None => {
            let created = tx.insert_diagnosis(patch).await?;
            (created.id, RecordOutcome::Imported)
        }
    };

    for synonym in &record.synonyms {
        tx.insert_synonym(diagnosis_id, synonym).await?;
    }

    Ok(outcome)
}

/// Enriches already-imported drugs with label sections. Never inserts.
///
/// Updated if at least one referenced drug exists, skipped otherwise.
pub async fn enrich_label<T: EntityTx>(
    tx: &mut T,
    label: &LabelPatch,
) -> Result<RecordOutcome, AppError> {
    let mut matched = 0usize;
    for ndc in &label.ndcs {
        if tx.update_drug(&label.drug_patch(ndc)).await? {
            matched += 1;
        }
    }

    if matched == 0 {
        Ok(RecordOutcome::Skipped("label matches no imported drug"))
    } else {
        Ok(RecordOutcome::Updated)
    }
}
