//! Seams between the import pipeline and its collaborators.
//!
//! - [`UpstreamFetcher`] - rate-limited, retrying HTTP GET returning JSON
//! - [`EntityStore`] / [`EntityTx`] - canonical entities and their children,
//!   written inside one transaction per page
//! - [`StateStore`] - durable key/value pairs for cursors and run statistics
//!
//! The PostgreSQL implementations live in `medsync-db`, the HTTP one in
//! `medsync-client`.

use std::future::Future;

use serde_json::Value;
use uuid::Uuid;

use crate::error::{AppError, UpstreamError};
use crate::models::{Diagnosis, DiagnosisPatch, Drug, DrugPatch, Ingredient};

/// A decoded upstream payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub payload: Value,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

impl Fetched {
    /// Number of retries that preceded success.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Issues one logical GET request with the caller's query parameters.
pub trait UpstreamFetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        endpoint: &str,
        query: &[(String, String)],
    ) -> impl Future<Output = Result<Fetched, UpstreamError>> + Send;
}

/// Write access to canonical entities inside one transaction.
///
/// Nothing becomes visible to other sessions until [`EntityTx::commit`].
/// Dropping a transaction without committing discards its writes.
pub trait EntityTx: Send {
    fn find_drug(
        &mut self,
        ndc: &str,
    ) -> impl Future<Output = Result<Option<Drug>, AppError>> + Send;

    /// Inserts a new drug. Fails if the NDC already exists.
    fn insert_drug(
        &mut self,
        patch: &DrugPatch,
    ) -> impl Future<Output = Result<Drug, AppError>> + Send;

    /// Applies the non-empty fields of `patch` to the drug with that NDC.
    /// Returns false if no such drug exists.
    fn update_drug(
        &mut self,
        patch: &DrugPatch,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Inserts the ingredient unless the exact (ndc, name, strength) exists.
    /// Returns true if a row was added.
    fn insert_ingredient(
        &mut self,
        ingredient: &Ingredient,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Records that label enrichment looked at this drug.
    fn mark_label_checked(
        &mut self,
        ndc: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn find_diagnosis(
        &mut self,
        condition_name: &str,
        icd10_code: &str,
    ) -> impl Future<Output = Result<Option<Diagnosis>, AppError>> + Send;

    /// Inserts a new diagnosis. Fails if the natural key already exists.
    fn insert_diagnosis(
        &mut self,
        patch: &DiagnosisPatch,
    ) -> impl Future<Output = Result<Diagnosis, AppError>> + Send;

    /// Applies the non-empty fields of `patch` to diagnosis `id`.
    fn update_diagnosis(
        &mut self,
        id: Uuid,
        patch: &DiagnosisPatch,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Inserts the synonym unless (diagnosis_id, synonym) exists.
    fn insert_synonym(
        &mut self,
        diagnosis_id: Uuid,
        synonym: &str,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Opens a savepoint scoping the writes of one record.
    fn savepoint(&mut self) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Keeps the writes made since [`EntityTx::savepoint`].
    fn release_savepoint(&mut self) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Discards the writes made since [`EntityTx::savepoint`]. Earlier writes
    /// in the transaction survive and the transaction stays usable.
    fn rollback_to_savepoint(&mut self) -> impl Future<Output = Result<(), AppError>> + Send;

    fn commit(self) -> impl Future<Output = Result<(), AppError>> + Send;

    fn rollback(self) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Source of entity transactions.
pub trait EntityStore: Send + Sync + 'static {
    type Tx: EntityTx;

    fn begin(&self) -> impl Future<Output = Result<Self::Tx, AppError>> + Send;

    /// NDCs of drugs missing label sections, least recently checked first.
    fn label_candidates(
        &self,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<String>, AppError>> + Send;
}

/// Durable key/value store for cursors and run statistics.
///
/// `set` is an upsert and is visible to the next `get` immediately.
pub trait StateStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, AppError>> + Send;

    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Every stored pair, ordered by key.
    fn list(&self) -> impl Future<Output = Result<Vec<(String, String)>, AppError>> + Send;
}
