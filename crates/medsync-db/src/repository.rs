//! PostgreSQL entity store: drugs, ingredients, diagnoses and synonyms.
//!
//! Every write of a page goes through one [`PgEntityTx`]. Updates use
//! `COALESCE(new, old)` so an absent incoming field never erases a stored
//! one; child rows use `ON CONFLICT DO NOTHING` on their natural key.

use medsync_core::error::AppError;
use medsync_core::models::{
    Diagnosis, DiagnosisPatch, Drug, DrugPatch, EntityCounts, Ingredient, UNKNOWN_PRODUCT_NAME,
};
use medsync_core::traits::{EntityStore, EntityTx};
use sqlx::{PgPool, Pool, Postgres, Transaction};
use uuid::Uuid;

/// Column list for drug SELECT/RETURNING clauses. Must remain a const literal
/// since format!() bypasses sqlx compile-time validation.
const DRUG_COLUMNS: &str = "id, ndc, product_name, generic_name, manufacturer, dosage_form, route_of_administration, indications_and_usage, adverse_reactions, warnings, created_at, updated_at";

const DIAGNOSIS_COLUMNS: &str =
    "id, condition_name, icd10_code, icd9_code, description, created_at, updated_at";

/// Repository for canonical entities in PostgreSQL.
///
/// # Examples
///
/// ```no_run
/// use sqlx::postgres::PgPoolOptions;
/// use medsync_db::PgEntityStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = PgPoolOptions::new()
///     .max_connections(5)
///     .connect("postgresql://localhost/medsync")
///     .await?;
///
/// let store = PgEntityStore::new(pool);
/// let counts = store.counts().await?;
/// println!("{} drugs", counts.drugs);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PgEntityStore {
    pool: Pool<Postgres>,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns row counts per entity table.
    pub async fn counts(&self) -> Result<EntityCounts, AppError> {
        let row: CountsRow = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM drugs) AS drugs,
                (SELECT COUNT(*) FROM drug_ingredients) AS ingredients,
                (SELECT COUNT(*) FROM diagnoses) AS diagnoses,
                (SELECT COUNT(*) FROM diagnosis_synonyms) AS synonyms
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(EntityCounts {
            drugs: row.drugs.unwrap_or(0),
            ingredients: row.ingredients.unwrap_or(0),
            diagnoses: row.diagnoses.unwrap_or(0),
            synonyms: row.synonyms.unwrap_or(0),
        })
    }

    /// Retrieves a drug by NDC outside any import transaction.
    pub async fn get_drug(&self, ndc: &str) -> Result<Option<Drug>, AppError> {
        let query = format!("SELECT {} FROM drugs WHERE ndc = $1", DRUG_COLUMNS);
        sqlx::query_as::<_, Drug>(&query)
            .bind(ndc)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::DatabaseError)
    }
}

impl EntityStore for PgEntityStore {
    type Tx = PgEntityTx;

    async fn begin(&self) -> Result<PgEntityTx, AppError> {
        let tx = self.pool.begin().await.map_err(AppError::DatabaseError)?;
        Ok(PgEntityTx { tx })
    }

    async fn label_candidates(&self, limit: u32) -> Result<Vec<String>, AppError> {
        sqlx::query_scalar(
            r#"
            SELECT ndc
            FROM drugs
            WHERE indications_and_usage IS NULL
               OR adverse_reactions IS NULL
               OR warnings IS NULL
            ORDER BY label_checked_at NULLS FIRST, ndc
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::DatabaseError)
    }
}

/// One page's worth of writes. Dropped without commit means rolled back.
pub struct PgEntityTx {
    tx: Transaction<'static, Postgres>,
}

impl PgEntityTx {
    async fn exec_raw(&mut self, statement: &'static str) -> Result<(), AppError> {
        sqlx::query(statement)
            .execute(&mut *self.tx)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(())
    }
}

impl EntityTx for PgEntityTx {
    async fn find_drug(&mut self, ndc: &str) -> Result<Option<Drug>, AppError> {
        let query = format!("SELECT {} FROM drugs WHERE ndc = $1", DRUG_COLUMNS);
        sqlx::query_as::<_, Drug>(&query)
            .bind(ndc)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(AppError::DatabaseError)
    }

    async fn insert_drug(&mut self, patch: &DrugPatch) -> Result<Drug, AppError> {
        let query = format!(
            r#"
            INSERT INTO drugs (
                ndc,
                product_name,
                generic_name,
                manufacturer,
                dosage_form,
                route_of_administration,
                indications_and_usage,
                adverse_reactions,
                warnings
            )
            VALUES ($1, COALESCE($2, $10), $3, COALESCE($4, ''), $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            DRUG_COLUMNS
        );
        sqlx::query_as::<_, Drug>(&query)
            .bind(&patch.ndc)
            .bind(&patch.product_name)
            .bind(&patch.generic_name)
            .bind(&patch.manufacturer)
            .bind(&patch.dosage_form)
            .bind(&patch.route_of_administration)
            .bind(&patch.indications_and_usage)
            .bind(&patch.adverse_reactions)
            .bind(&patch.warnings)
            .bind(UNKNOWN_PRODUCT_NAME)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(AppError::DatabaseError)
    }

    async fn update_drug(&mut self, patch: &DrugPatch) -> Result<bool, AppError> {
        // updated_at only moves when a value actually changes
        let result = sqlx::query(
            r#"
            UPDATE drugs
            SET product_name = COALESCE($2, product_name),
                generic_name = COALESCE($3, generic_name),
                manufacturer = COALESCE($4, manufacturer),
                dosage_form = COALESCE($5, dosage_form),
                route_of_administration = COALESCE($6, route_of_administration),
                indications_and_usage = COALESCE($7, indications_and_usage),
                adverse_reactions = COALESCE($8, adverse_reactions),
                warnings = COALESCE($9, warnings),
                updated_at = CASE
                    WHEN ROW(product_name, generic_name, manufacturer, dosage_form,
                             route_of_administration, indications_and_usage,
                             adverse_reactions, warnings)
                         IS DISTINCT FROM
                         ROW(COALESCE($2, product_name), COALESCE($3, generic_name),
                             COALESCE($4, manufacturer), COALESCE($5, dosage_form),
                             COALESCE($6, route_of_administration),
                             COALESCE($7, indications_and_usage),
                             COALESCE($8, adverse_reactions), COALESCE($9, warnings))
                    THEN NOW()
                    ELSE updated_at
                END
            WHERE ndc = $1
            "#,
        )
        .bind(&patch.ndc)
        .bind(non_empty(&patch.product_name))
        .bind(non_empty(&patch.generic_name))
        .bind(non_empty(&patch.manufacturer))
        .bind(non_empty(&patch.dosage_form))
        .bind(non_empty(&patch.route_of_administration))
        .bind(non_empty(&patch.indications_and_usage))
        .bind(non_empty(&patch.adverse_reactions))
        .bind(non_empty(&patch.warnings))
        .execute(&mut *self.tx)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_ingredient(&mut self, ingredient: &Ingredient) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO drug_ingredients (ndc, name, strength)
            VALUES ($1, $2, $3)
            ON CONFLICT (ndc, name, strength) DO NOTHING
            "#,
        )
        .bind(&ingredient.ndc)
        .bind(&ingredient.name)
        .bind(ingredient.strength.as_deref().unwrap_or(""))
        .execute(&mut *self.tx)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_label_checked(&mut self, ndc: &str) -> Result<(), AppError> {
        // clock_timestamp keeps a batch in check order; NOW() is fixed per transaction
        sqlx::query("UPDATE drugs SET label_checked_at = clock_timestamp() WHERE ndc = $1")
            .bind(ndc)
            .execute(&mut *self.tx)
            .await
            .map_err(AppError::DatabaseError)?;
        Ok(())
    }

    async fn find_diagnosis(
        &mut self,
        condition_name: &str,
        icd10_code: &str,
    ) -> Result<Option<Diagnosis>, AppError> {
        let query = format!(
            "SELECT {} FROM diagnoses WHERE condition_name = $1 AND icd10_code = $2",
            DIAGNOSIS_COLUMNS
        );
        sqlx::query_as::<_, Diagnosis>(&query)
            .bind(condition_name)
            .bind(icd10_code)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(AppError::DatabaseError)
    }

    async fn insert_diagnosis(&mut self, patch: &DiagnosisPatch) -> Result<Diagnosis, AppError> {
        let query = format!(
            r#"
            INSERT INTO diagnoses (condition_name, icd10_code, icd9_code, description)
            VALUES ($1, $2, $3, $4)
            RETURNING {}
            "#,
            DIAGNOSIS_COLUMNS
        );
        sqlx::query_as::<_, Diagnosis>(&query)
            .bind(&patch.condition_name)
            .bind(&patch.icd10_code)
            .bind(&patch.icd9_code)
            .bind(&patch.description)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(AppError::DatabaseError)
    }

    async fn update_diagnosis(&mut self, id: Uuid, patch: &DiagnosisPatch) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE diagnoses
            SET icd9_code = COALESCE($2, icd9_code),
                description = COALESCE($3, description),
                updated_at = CASE
                    WHEN ROW(icd9_code, description)
                         IS DISTINCT FROM
                         ROW(COALESCE($2, icd9_code), COALESCE($3, description))
                    THEN NOW()
                    ELSE updated_at
                END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(non_empty(&patch.icd9_code))
        .bind(non_empty(&patch.description))
        .execute(&mut *self.tx)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_synonym(&mut self, diagnosis_id: Uuid, synonym: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO diagnosis_synonyms (diagnosis_id, synonym)
            VALUES ($1, $2)
            ON CONFLICT (diagnosis_id, synonym) DO NOTHING
            "#,
        )
        .bind(diagnosis_id)
        .bind(synonym)
        .execute(&mut *self.tx)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(result.rows_affected() > 0)
    }

    async fn savepoint(&mut self) -> Result<(), AppError> {
        self.exec_raw("SAVEPOINT medsync_record").await
    }

    async fn release_savepoint(&mut self) -> Result<(), AppError> {
        self.exec_raw("RELEASE SAVEPOINT medsync_record").await
    }

    async fn rollback_to_savepoint(&mut self) -> Result<(), AppError> {
        self.exec_raw("ROLLBACK TO SAVEPOINT medsync_record").await
    }

    async fn commit(self) -> Result<(), AppError> {
        self.tx.commit().await.map_err(AppError::DatabaseError)
    }

    async fn rollback(self) -> Result<(), AppError> {
        self.tx.rollback().await.map_err(AppError::DatabaseError)
    }
}

/// Blank strings bind as NULL so COALESCE keeps the stored value.
fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Helper struct for deserializing count query results
#[derive(sqlx::FromRow)]
struct CountsRow {
    drugs: Option<i64>,
    ingredients: Option<i64>,
    diagnoses: Option<i64>,
    synonyms: Option<i64>,
}
