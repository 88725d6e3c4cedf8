//! Mapping of raw upstream JSON into canonical patches.
//!
//! Two levels:
//! - page level: pull the record list out of a response payload; a payload
//!   without one is a [`AppError::MalformedResponse`]
//! - record level: derive the natural key and fields of one record; a
//!   missing key is a skip, a record that is not even an object is
//!   malformed, neither aborts the page
//!
//! Empty strings are treated as absent everywhere, so a blank upstream field
//! can never erase a stored value.

use serde_json::{Map, Value};

use crate::error::AppError;
use crate::models::{DiagnosisPatch, DrugPatch, Ingredient, LabelPatch};

/// Record-level normalization result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized<T> {
    Ready(T),
    /// Usable record without a natural key.
    Skip(&'static str),
    /// Record that cannot be interpreted.
    Malformed(String),
}

/// One NDC listing: the drug plus its ingredients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrugRecord {
    pub patch: DrugPatch,
    pub ingredients: Vec<Ingredient>,
}

/// One condition row: the diagnosis plus its synonyms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionRecord {
    pub patch: DiagnosisPatch,
    pub synonyms: Vec<String>,
}

/// Extracts `results[]` from an openFDA payload.
pub fn openfda_results(source_name: &str, payload: &Value) -> Result<Vec<Value>, AppError> {
    let malformed = |reason: &str| AppError::MalformedResponse {
        source_name: source_name.to_string(),
        reason: reason.to_string(),
    };

    let object = payload
        .as_object()
        .ok_or_else(|| malformed("top-level value is not an object"))?;

    match object.get("results") {
        Some(Value::Array(results)) => Ok(results.clone()),
        Some(Value::Null) => Ok(Vec::new()),
        Some(_) => Err(malformed("results is not a list")),
        None => Err(malformed("missing results list")),
    }
}

/// Pivots a ClinicalTables search response into one object per row.
///
/// The response is columnar: `[total, codes, {field: [value per row]},
/// [[display fields per row]]]`. Each row object carries `code`,
/// `primary_name` (first display field) and every extra field.
pub fn clinicaltables_rows(source_name: &str, payload: &Value) -> Result<Vec<Value>, AppError> {
    let malformed = |reason: &str| AppError::MalformedResponse {
        source_name: source_name.to_string(),
        reason: reason.to_string(),
    };

    let parts = payload
        .as_array()
        .ok_or_else(|| malformed("top-level value is not an array"))?;
    if parts.len() < 3 {
        return Err(malformed("expected at least 3 elements"));
    }

    let codes = parts[1].as_array().cloned().unwrap_or_default();
    let extras: Map<String, Value> = parts[2..]
        .iter()
        .find_map(|part| part.as_object().cloned())
        .unwrap_or_default();
    let display = parts[2..]
        .iter()
        .find_map(|part| part.as_array().cloned())
        .unwrap_or_default();

    let row_count = codes.len().max(display.len());
    let mut rows = Vec::with_capacity(row_count);

    for i in 0..row_count {
        let mut row = Map::new();
        if let Some(code) = codes.get(i) {
            row.insert("code".to_string(), code.clone());
        }
        let primary_name = match display.get(i) {
            Some(Value::Array(fields)) => fields.first().cloned(),
            Some(other) => Some(other.clone()),
            None => None,
        };
        if let Some(name) = primary_name {
            row.insert("primary_name".to_string(), name);
        }
        for (field, values) in &extras {
            if let Some(value) = values.as_array().and_then(|values| values.get(i)) {
                row.insert(field.clone(), value.clone());
            }
        }
        rows.push(Value::Object(row));
    }

    Ok(rows)
}

/// Maps one openFDA NDC record.
pub fn ndc_record(record: &Value) -> Normalized<DrugRecord> {
    let Some(object) = record.as_object() else {
        return Normalized::Malformed(format!("NDC record is not an object: {}", preview(record)));
    };

    let Some(ndc) = text(object.get("product_ndc")) else {
        return Normalized::Skip("missing product_ndc");
    };

    let product_name = text(object.get("brand_name"))
        .or_else(|| text(object.get("brand_name_base")))
        .or_else(|| text(object.get("generic_name")));

    let manufacturer = text(object.get("labeler_name")).or_else(|| {
        object
            .get("openfda")
            .and_then(|openfda| joined(openfda.get("manufacturer_name"), ", "))
    });

    let patch = DrugPatch {
        product_name,
        generic_name: text(object.get("generic_name")),
        manufacturer,
        dosage_form: text(object.get("dosage_form")),
        route_of_administration: joined(object.get("route"), ","),
        ..DrugPatch::new(ndc.clone())
    };

    let mut ingredients: Vec<Ingredient> = Vec::new();
    if let Some(Value::Array(items)) = object.get("active_ingredients") {
        for item in items {
            let Some(name) = text(item.get("name")) else {
                continue;
            };
            let ingredient = Ingredient {
                ndc: ndc.clone(),
                name,
                strength: text(item.get("strength")),
            };
            if !ingredients.contains(&ingredient) {
                ingredients.push(ingredient);
            }
        }
    }

    Normalized::Ready(DrugRecord { patch, ingredients })
}

/// Maps one openFDA drug label document.
///
/// `fallback_ndc` is used when the label does not list its own product
/// codes (a label fetched for a specific drug).
pub fn label_record(record: &Value, fallback_ndc: Option<&str>) -> Normalized<LabelPatch> {
    let Some(object) = record.as_object() else {
        return Normalized::Malformed(format!(
            "label record is not an object: {}",
            preview(record)
        ));
    };

    let mut ndcs = object
        .get("openfda")
        .map(|openfda| string_list(openfda.get("product_ndc")))
        .unwrap_or_default();
    if let Some(ndc) = fallback_ndc {
        if !ndcs.iter().any(|known| known == ndc) {
            ndcs = vec![ndc.to_string()];
        }
    }
    if ndcs.is_empty() {
        return Normalized::Skip("label lists no product_ndc");
    }

    let label = LabelPatch {
        ndcs,
        indications_and_usage: joined(object.get("indications_and_usage"), "\n\n"),
        adverse_reactions: joined(object.get("adverse_reactions"), "\n\n"),
        warnings: joined(object.get("warnings"), "\n\n")
            .or_else(|| joined(object.get("warnings_and_cautions"), "\n\n")),
    };

    if !label.has_sections() {
        return Normalized::Skip("label has no enrichable sections");
    }

    Normalized::Ready(label)
}

/// Maps one pivoted ClinicalTables condition row.
pub fn condition_record(record: &Value) -> Normalized<ConditionRecord> {
    let Some(object) = record.as_object() else {
        return Normalized::Malformed(format!(
            "condition row is not an object: {}",
            preview(record)
        ));
    };

    let Some(name) = text(object.get("primary_name")) else {
        return Normalized::Skip("missing primary_name");
    };
    let Some(icd10_code) = first_code(object.get("icd10cm_codes")) else {
        return Normalized::Skip("missing icd10 code");
    };

    let description = text(object.get("consumer_name")).filter(|consumer| consumer != &name);

    let patch = DiagnosisPatch {
        icd9_code: first_code(object.get("term_icd9_code")),
        description,
        ..DiagnosisPatch::new(name, icd10_code)
    };

    let mut synonyms: Vec<String> = Vec::new();
    for synonym in synonym_list(object.get("synonyms")) {
        if !synonyms.contains(&synonym) {
            synonyms.push(synonym);
        }
    }

    Normalized::Ready(ConditionRecord { patch, synonyms })
}

/// Trimmed, non-empty text. Numbers are rendered as text.
/// Trimmed text with NUL characters removed; PostgreSQL text cannot hold them.
fn text(value: Option<&Value>) -> Option<String> {
    let raw = match value? {
        Value::String(s) => s.replace('\0', "").trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!raw.is_empty()).then_some(raw)
}

/// A string, or the non-empty elements of a list joined by `separator`.
fn joined(value: Option<&Value>, separator: &str) -> Option<String> {
    match value? {
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(|item| text(Some(item))).collect();
            (!parts.is_empty()).then(|| parts.join(separator))
        }
        other => text(Some(other)),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(|item| text(Some(item))).collect(),
        Some(other) => text(Some(other)).into_iter().collect(),
        None => Vec::new(),
    }
}

/// Synonyms arrive as a list or as one comma-separated string.
fn synonym_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect(),
        other => string_list(other),
    }
}

/// First code of a code field that may be a list or a comma-separated string.
fn first_code(value: Option<&Value>) -> Option<String> {
    let first = match value? {
        Value::Array(items) => text(items.first())?,
        other => text(Some(other))?,
    };
    first
        .split(',')
        .next()
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(str::to_string)
}

fn preview(value: &Value) -> String {
    let rendered = value.to_string();
    if rendered.chars().count() > 80 {
        format!("{}...", rendered.chars().take(80).collect::<String>())
    } else {
        rendered
    }
}
