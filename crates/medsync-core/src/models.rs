//! Canonical entities, their child records and the merge patches built from
//! upstream records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Product name stored when the upstream record carries none.
pub const UNKNOWN_PRODUCT_NAME: &str = "Unknown";

/// Database model for a drug, keyed by NDC product code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Drug {
    pub id: Uuid,
    pub ndc: String,
    pub product_name: String,
    pub generic_name: Option<String>,
    pub manufacturer: String,
    pub dosage_form: Option<String>,
    pub route_of_administration: Option<String>,
    pub indications_and_usage: Option<String>,
    pub adverse_reactions: Option<String>,
    pub warnings: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Drug {
    /// True if any label section is still missing.
    pub fn needs_label(&self) -> bool {
        self.indications_and_usage.is_none()
            || self.adverse_reactions.is_none()
            || self.warnings.is_none()
    }
}

/// Incoming values for one drug. `None` means "upstream said nothing".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrugPatch {
    pub ndc: String,
    pub product_name: Option<String>,
    pub generic_name: Option<String>,
    pub manufacturer: Option<String>,
    pub dosage_form: Option<String>,
    pub route_of_administration: Option<String>,
    pub indications_and_usage: Option<String>,
    pub adverse_reactions: Option<String>,
    pub warnings: Option<String>,
}

impl DrugPatch {
    pub fn new(ndc: impl Into<String>) -> Self {
        Self {
            ndc: ndc.into(),
            ..Self::default()
        }
    }

    /// True if the patch carries no field besides the key.
    pub fn is_empty(&self) -> bool {
        self.product_name.is_none()
            && self.generic_name.is_none()
            && self.manufacturer.is_none()
            && self.dosage_form.is_none()
            && self.route_of_administration.is_none()
            && self.indications_and_usage.is_none()
            && self.adverse_reactions.is_none()
            && self.warnings.is_none()
    }

    /// Overwrites only the fields this patch provides. Returns true if
    /// anything changed.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::Utc;
    /// use medsync_core::models::DrugPatch;
    ///
    /// let mut drug = DrugPatch {
    ///     generic_name: Some("ibuprofen".into()),
    ///     ..DrugPatch::new("0001-0001")
    /// }
    /// .into_drug(uuid::Uuid::nil(), Utc::now());
    ///
    /// let patch = DrugPatch {
    ///     dosage_form: Some("TABLET".into()),
    ///     ..DrugPatch::new("0001-0001")
    /// };
    /// assert!(patch.apply_to(&mut drug));
    /// assert_eq!(drug.generic_name.as_deref(), Some("ibuprofen"));
    /// assert_eq!(drug.dosage_form.as_deref(), Some("TABLET"));
    /// ```
    pub fn apply_to(&self, drug: &mut Drug) -> bool {
        let mut changed = false;
        changed |= merge_required(&mut drug.product_name, &self.product_name);
        changed |= merge_optional(&mut drug.generic_name, &self.generic_name);
        changed |= merge_required(&mut drug.manufacturer, &self.manufacturer);
        changed |= merge_optional(&mut drug.dosage_form, &self.dosage_form);
        changed |= merge_optional(
            &mut drug.route_of_administration,
            &self.route_of_administration,
        );
        changed |= merge_optional(&mut drug.indications_and_usage, &self.indications_and_usage);
        changed |= merge_optional(&mut drug.adverse_reactions, &self.adverse_reactions);
        changed |= merge_optional(&mut drug.warnings, &self.warnings);
        changed
    }

    /// Builds a fresh entity, filling required fields with defaults.
    pub fn into_drug(self, id: Uuid, now: DateTime<Utc>) -> Drug {
        Drug {
            id,
            ndc: self.ndc,
            product_name: self
                .product_name
                .unwrap_or_else(|| UNKNOWN_PRODUCT_NAME.to_string()),
            generic_name: self.generic_name,
            manufacturer: self.manufacturer.unwrap_or_default(),
            dosage_form: self.dosage_form,
            route_of_administration: self.route_of_administration,
            indications_and_usage: self.indications_and_usage,
            adverse_reactions: self.adverse_reactions,
            warnings: self.warnings,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Active ingredient of a drug. Unique on (ndc, name, strength).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ingredient {
    pub ndc: String,
    pub name: String,
    pub strength: Option<String>,
}

/// Database model for a diagnosis, keyed by (condition name, ICD-10 code).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Diagnosis {
    pub id: Uuid,
    pub condition_name: String,
    pub icd10_code: String,
    pub icd9_code: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Incoming values for one diagnosis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosisPatch {
    pub condition_name: String,
    pub icd10_code: String,
    pub icd9_code: Option<String>,
    pub description: Option<String>,
}

impl DiagnosisPatch {
    pub fn new(condition_name: impl Into<String>, icd10_code: impl Into<String>) -> Self {
        Self {
            condition_name: condition_name.into(),
            icd10_code: icd10_code.into(),
            ..Self::default()
        }
    }

    /// Overwrites only the fields this patch provides.
    pub fn apply_to(&self, diagnosis: &mut Diagnosis) -> bool {
        let mut changed = false;
        changed |= merge_optional(&mut diagnosis.icd9_code, &self.icd9_code);
        changed |= merge_optional(&mut diagnosis.description, &self.description);
        changed
    }

    pub fn into_diagnosis(self, id: Uuid, now: DateTime<Utc>) -> Diagnosis {
        Diagnosis {
            id,
            condition_name: self.condition_name,
            icd10_code: self.icd10_code,
            icd9_code: self.icd9_code,
            description: self.description,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Alternative name for a diagnosis. Unique on (diagnosis_id, synonym).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Synonym {
    pub diagnosis_id: Uuid,
    pub synonym: String,
}

/// Label sections for one or more drugs, identified by NDC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelPatch {
    pub ndcs: Vec<String>,
    pub indications_and_usage: Option<String>,
    pub adverse_reactions: Option<String>,
    pub warnings: Option<String>,
}

impl LabelPatch {
    /// The drug patch applied to each referenced NDC.
    pub fn drug_patch(&self, ndc: &str) -> DrugPatch {
        DrugPatch {
            indications_and_usage: self.indications_and_usage.clone(),
            adverse_reactions: self.adverse_reactions.clone(),
            warnings: self.warnings.clone(),
            ..DrugPatch::new(ndc)
        }
    }

    pub fn has_sections(&self) -> bool {
        self.indications_and_usage.is_some()
            || self.adverse_reactions.is_some()
            || self.warnings.is_some()
    }
}

/// Row counts per entity table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    pub drugs: i64,
    pub ingredients: i64,
    pub diagnoses: i64,
    pub synonyms: i64,
}

fn merge_optional(target: &mut Option<String>, incoming: &Option<String>) -> bool {
    match incoming {
        Some(value) if !value.is_empty() && target.as_deref() != Some(value.as_str()) => {
            *target = Some(value.clone());
            true
        }
        _ => false,
    }
}

fn merge_required(target: &mut String, incoming: &Option<String>) -> bool {
    match incoming {
        Some(value) if !value.is_empty() && target != value => {
            *target = value.clone();
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored_drug() -> Drug {
        DrugPatch {
            product_name: Some("Advil".to_string()),
            generic_name: Some("ibuprofen".to_string()),
            manufacturer: Some("Pfizer".to_string()),
            ..DrugPatch::new("0573-0164")
        }
        .into_drug(Uuid::new_v4(), Utc::now())
    }

    #[test]
    fn test_into_drug_defaults() {
        let drug = DrugPatch::new("1234-5678").into_drug(Uuid::nil(), Utc::now());
        assert_eq!(drug.product_name, UNKNOWN_PRODUCT_NAME);
        assert_eq!(drug.manufacturer, "");
        assert!(drug.generic_name.is_none());
        assert!(drug.needs_label());
    }

    #[test]
    fn test_apply_keeps_fields_absent_from_patch() {
        let mut drug = stored_drug();
        let patch = DrugPatch {
            dosage_form: Some("TABLET, FILM COATED".to_string()),
            ..DrugPatch::new("0573-0164")
        };

        assert!(patch.apply_to(&mut drug));
        assert_eq!(drug.generic_name.as_deref(), Some("ibuprofen"));
        assert_eq!(drug.product_name, "Advil");
        assert_eq!(drug.manufacturer, "Pfizer");
        assert_eq!(drug.dosage_form.as_deref(), Some("TABLET, FILM COATED"));
    }

    #[test]
    fn test_apply_ignores_empty_strings() {
        let mut drug = stored_drug();
        let patch = DrugPatch {
            manufacturer: Some(String::new()),
            generic_name: Some(String::new()),
            ..DrugPatch::new("0573-0164")
        };

        assert!(!patch.apply_to(&mut drug));
        assert_eq!(drug.manufacturer, "Pfizer");
        assert_eq!(drug.generic_name.as_deref(), Some("ibuprofen"));
    }

    #[test]
    fn test_apply_same_values_reports_unchanged() {
        let mut drug = stored_drug();
        let patch = DrugPatch {
            product_name: Some("Advil".to_string()),
            ..DrugPatch::new("0573-0164")
        };
        assert!(!patch.apply_to(&mut drug));
    }

    #[test]
    fn test_diagnosis_patch_enriches() {
        let mut diagnosis =
            DiagnosisPatch::new("Asthma", "J45.909").into_diagnosis(Uuid::nil(), Utc::now());
        let patch = DiagnosisPatch {
            icd9_code: Some("493.90".to_string()),
            ..DiagnosisPatch::new("Asthma", "J45.909")
        };
        assert!(patch.apply_to(&mut diagnosis));
        assert_eq!(diagnosis.icd9_code.as_deref(), Some("493.90"));

        let blank = DiagnosisPatch::new("Asthma", "J45.909");
        assert!(!blank.apply_to(&mut diagnosis));
        assert_eq!(diagnosis.icd9_code.as_deref(), Some("493.90"));
    }

    #[test]
    fn test_label_patch_to_drug_patch() {
        let label = LabelPatch {
            ndcs: vec!["0573-0164".to_string()],
            warnings: Some("Stomach bleeding warning".to_string()),
            ..LabelPatch::default()
        };
        assert!(label.has_sections());
        let patch = label.drug_patch("0573-0164");
        assert_eq!(patch.ndc, "0573-0164");
        assert!(patch.product_name.is_none());
        assert_eq!(patch.warnings.as_deref(), Some("Stomach bleeding warning"));
    }
}
