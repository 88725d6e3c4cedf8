//! In-memory store and scripted fetcher for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AppError, UpstreamError};
use crate::models::{Diagnosis, DiagnosisPatch, Drug, DrugPatch, Ingredient, Synonym};
use crate::traits::{EntityStore, EntityTx, Fetched, StateStore, UpstreamFetcher};

#[derive(Debug, Clone, Default)]
pub struct MemState {
    pub drugs: BTreeMap<String, Drug>,
    pub ingredients: Vec<Ingredient>,
    pub diagnoses: Vec<Diagnosis>,
    pub synonyms: Vec<Synonym>,
    pub label_checked: HashMap<String, u64>,
    pub check_tick: u64,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    entities: Arc<Mutex<MemState>>,
    state: Arc<Mutex<BTreeMap<String, String>>>,
    fail_commit: Arc<AtomicBool>,
    fail_stats_writes: Arc<AtomicBool>,
    rejected_ndcs: Arc<Mutex<HashSet<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MemState {
        self.entities.lock().unwrap().clone()
    }

    pub fn drug(&self, ndc: &str) -> Option<Drug> {
        self.entities.lock().unwrap().drugs.get(ndc).cloned()
    }

    pub fn state_value(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().get(key).cloned()
    }

    pub fn set_state_value(&self, key: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stats_writes(&self, fail: bool) {
        self.fail_stats_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes ingredient writes for `ndc` fail, after its drug row is written.
    pub fn reject_ingredients_of(&self, ndc: &str) {
        self.rejected_ndcs.lock().unwrap().insert(ndc.to_string());
    }
}

pub struct MemoryTx {
    shared: Arc<Mutex<MemState>>,
    working: MemState,
    savepoint: Option<MemState>,
    rejected_ndcs: HashSet<String>,
    fail_commit: bool,
}

impl EntityTx for MemoryTx {
    async fn find_drug(&mut self, ndc: &str) -> Result<Option<Drug>, AppError> {
        Ok(self.working.drugs.get(ndc).cloned())
    }

    async fn insert_drug(&mut self, patch: &DrugPatch) -> Result<Drug, AppError> {
        if self.working.drugs.contains_key(&patch.ndc) {
            return Err(AppError::Generic(format!("duplicate ndc {}", patch.ndc)));
        }
        let drug = patch.clone().into_drug(Uuid::new_v4(), Utc::now());
        self.working.drugs.insert(drug.ndc.clone(), drug.clone());
        Ok(drug)
    }

    async fn update_drug(&mut self, patch: &DrugPatch) -> Result<bool, AppError> {
        match self.working.drugs.get_mut(&patch.ndc) {
            Some(drug) => {
                if patch.apply_to(drug) {
                    drug.updated_at = Utc::now();
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_ingredient(&mut self, ingredient: &Ingredient) -> Result<bool, AppError> {
        if self.rejected_ndcs.contains(&ingredient.ndc) {
            return Err(AppError::DatabaseError(sqlx::Error::Protocol(format!(
                "ingredient rejected for {}",
                ingredient.ndc
            ))));
        }
        if self.working.ingredients.contains(ingredient) {
            return Ok(false);
        }
        self.working.ingredients.push(ingredient.clone());
        Ok(true)
    }

    async fn mark_label_checked(&mut self, ndc: &str) -> Result<(), AppError> {
        self.working.check_tick += 1;
        let tick = self.working.check_tick;
        self.working.label_checked.insert(ndc.to_string(), tick);
        Ok(())
    }

    async fn find_diagnosis(
        &mut self,
        condition_name: &str,
        icd10_code: &str,
    ) -> Result<Option<Diagnosis>, AppError> {
        Ok(self
            .working
            .diagnoses
            .iter()
            .find(|d| d.condition_name == condition_name && d.icd10_code == icd10_code)
            .cloned())
    }

    async fn insert_diagnosis(&mut self, patch: &DiagnosisPatch) -> Result<Diagnosis, AppError> {
        let diagnosis = patch.clone().into_diagnosis(Uuid::new_v4(), Utc::now());
        self.working.diagnoses.push(diagnosis.clone());
        Ok(diagnosis)
    }

    async fn update_diagnosis(
        &mut self,
        id: Uuid,
        patch: &DiagnosisPatch,
    ) -> Result<bool, AppError> {
        match self.working.diagnoses.iter_mut().find(|d| d.id == id) {
            Some(diagnosis) => {
                if patch.apply_to(diagnosis) {
                    diagnosis.updated_at = Utc::now();
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_synonym(&mut self, diagnosis_id: Uuid, synonym: &str) -> Result<bool, AppError> {
        let row = Synonym {
            diagnosis_id,
            synonym: synonym.to_string(),
        };
        if self.working.synonyms.contains(&row) {
            return Ok(false);
        }
        self.working.synonyms.push(row);
        Ok(true)
    }

    async fn savepoint(&mut self) -> Result<(), AppError> {
        self.savepoint = Some(self.working.clone());
        Ok(())
    }

    async fn release_savepoint(&mut self) -> Result<(), AppError> {
        self.savepoint = None;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> Result<(), AppError> {
        match self.savepoint.take() {
            Some(saved) => {
                self.working = saved;
                Ok(())
            }
            None => Err(AppError::Generic("no savepoint to roll back to".to_string())),
        }
    }

    async fn commit(self) -> Result<(), AppError> {
        if self.fail_commit {
            return Err(AppError::DatabaseError(sqlx::Error::PoolClosed));
        }
        *self.shared.lock().unwrap() = self.working;
        Ok(())
    }

    async fn rollback(self) -> Result<(), AppError> {
        Ok(())
    }
}

impl EntityStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, AppError> {
        Ok(MemoryTx {
            shared: self.entities.clone(),
            working: self.snapshot(),
            savepoint: None,
            rejected_ndcs: self.rejected_ndcs.lock().unwrap().clone(),
            fail_commit: self.fail_commit.load(Ordering::SeqCst),
        })
    }

    async fn label_candidates(&self, limit: u32) -> Result<Vec<String>, AppError> {
        let state = self.snapshot();
        let mut candidates: Vec<(u64, String)> = state
            .drugs
            .values()
            .filter(|drug| drug.needs_label())
            .map(|drug| {
                let tick = state.label_checked.get(&drug.ndc).copied().unwrap_or(0);
                (tick, drug.ndc.clone())
            })
            .collect();
        candidates.sort();
        Ok(candidates
            .into_iter()
            .take(limit as usize)
            .map(|(_, ndc)| ndc)
            .collect())
    }
}

impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.state_value(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        if key.starts_with("stats:") && self.fail_stats_writes.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(sqlx::Error::PoolTimedOut));
        }
        self.set_state_value(key, value);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(String, String)>, AppError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Replays canned responses in order and records every request.
#[derive(Default)]
pub struct ScriptedFetcher {
    responses: Mutex<VecDeque<Result<Value, UpstreamError>>>,
    calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
    delay: Option<Duration>,
}

impl ScriptedFetcher {
    pub fn new(responses: Vec<Result<Value, UpstreamError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Makes every fetch take `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Value of query parameter `name` in call `index`.
    pub fn query_param(&self, index: usize, name: &str) -> Option<String> {
        self.calls
            .lock()
            .unwrap()
            .get(index)
            .and_then(|(_, query)| query.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone()))
    }
}

impl UpstreamFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        endpoint: &str,
        query: &[(String, String)],
    ) -> Result<Fetched, UpstreamError> {
        self.calls
            .lock()
            .unwrap()
            .push((endpoint.to_string(), query.to_vec()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(UpstreamError::Network("script exhausted".to_string())));
        next.map(|payload| Fetched {
            payload,
            attempts: 1,
        })
    }
}
