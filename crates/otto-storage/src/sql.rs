//! SQL storage backend (embedded SQLite via sqlx).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::info;

use otto_core::{Error, ParamDict, Result, Status};
use otto_tunables::TunableGroups;

use crate::memory::extract_score;
use crate::storage::{ExperimentScope, ExperimentSpec, Storage};
use crate::trial::TrialRecord;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS experiments (
        experiment_id TEXT PRIMARY KEY,
        description TEXT,
        root_env_hash TEXT NOT NULL,
        opt_target TEXT NOT NULL,
        param_space_hash TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS trials (
        experiment_id TEXT NOT NULL,
        trial_id INTEGER NOT NULL,
        status TEXT NOT NULL,
        config_hash TEXT NOT NULL,
        tunables_json TEXT NOT NULL,
        results_json TEXT,
        telemetry_json TEXT,
        ts_start TEXT NOT NULL,
        ts_end TEXT,
        PRIMARY KEY (experiment_id, trial_id)
    )",
];

fn db_err(err: sqlx::Error) -> Error {
    Error::storage(err.to_string())
}

/// SQLite-backed storage; suitable for single-scheduler experiments.
pub struct SqlStorage {
    pool: SqlitePool,
}

impl SqlStorage {
    /// Connect and bootstrap the schema. Use `sqlite::memory:` for an
    /// ephemeral database or `sqlite://file.db?mode=rwc` for a file.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(db_err)?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await.map_err(db_err)?;
        }
        info!(url, "sql storage ready");
        Ok(SqlStorage { pool })
    }
}

#[async_trait]
impl Storage for SqlStorage {
    async fn experiment(&self, spec: ExperimentSpec) -> Result<Box<dyn ExperimentScope>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let existing = sqlx::query(
            "SELECT root_env_hash, opt_target, param_space_hash
             FROM experiments WHERE experiment_id = ?",
        )
        .bind(&spec.experiment_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        match existing {
            Some(row) => {
                let mismatch = |reason: &str| {
                    Err(Error::ExperimentMismatch {
                        experiment_id: spec.experiment_id.clone(),
                        reason: reason.to_string(),
                    })
                };
                if row.get::<String, _>("opt_target") != spec.opt_target {
                    return mismatch("optimization target differs");
                }
                if row.get::<String, _>("param_space_hash") != spec.param_space_hash {
                    return mismatch("tunable parameter space differs");
                }
                if row.get::<String, _>("root_env_hash") != spec.root_env_hash {
                    return mismatch("root environment differs");
                }
            }
            None => {
                sqlx::query(
                    "INSERT INTO experiments
                     (experiment_id, description, root_env_hash, opt_target, param_space_hash)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&spec.experiment_id)
                .bind(&spec.description)
                .bind(&spec.root_env_hash)
                .bind(&spec.opt_target)
                .bind(&spec.param_space_hash)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }
        tx.commit().await.map_err(db_err)?;
        Ok(Box::new(SqlScope {
            pool: self.pool.clone(),
            spec,
        }))
    }
}

struct SqlScope {
    pool: SqlitePool,
    spec: ExperimentSpec,
}

impl SqlScope {
    fn trial_from_row(&self, row: &sqlx::sqlite::SqliteRow) -> Result<TrialRecord> {
        let tunables_json: String = row.get("tunables_json");
        let tunables = TunableGroups::from_json(&serde_json::from_str(&tunables_json)?)?;
        let results: Option<ParamDict> = row
            .get::<Option<String>, _>("results_json")
            .map(|json| serde_json::from_str(&json))
            .transpose()?;
        let telemetry: Option<ParamDict> = row
            .get::<Option<String>, _>("telemetry_json")
            .map(|json| serde_json::from_str(&json))
            .transpose()?;
        let status: Status = row.get::<String, _>("status").parse()?;
        let ts_start: String = row.get("ts_start");
        let ts_end: Option<String> = row.get("ts_end");
        Ok(TrialRecord {
            trial_id: row.get::<i64, _>("trial_id") as u64,
            experiment_id: row.get("experiment_id"),
            tunables,
            status,
            results,
            telemetry,
            config_hash: row.get("config_hash"),
            ts_start: parse_ts(&ts_start)?,
            ts_end: ts_end.as_deref().map(parse_ts).transpose()?,
        })
    }

    async fn fetch_status(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        experiment_id: &str,
        trial_id: u64,
    ) -> Result<Status> {
        let row = sqlx::query(
            "SELECT status FROM trials WHERE experiment_id = ? AND trial_id = ?",
        )
        .bind(experiment_id)
        .bind(trial_id as i64)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::storage(format!("no such trial: {trial_id}")))?;
        row.get::<String, _>("status").parse()
    }
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| Error::storage(format!("malformed timestamp: {err}")))
}

#[async_trait]
impl ExperimentScope for SqlScope {
    fn experiment_id(&self) -> &str {
        &self.spec.experiment_id
    }

    async fn load(&self) -> Result<(Vec<ParamDict>, Vec<Option<f64>>, Vec<Status>)> {
        let mut configs = Vec::new();
        let mut scores = Vec::new();
        let mut statuses = Vec::new();
        let ids = std::iter::once(&self.spec.experiment_id).chain(&self.spec.merge_experiments);
        for experiment_id in ids {
            let rows = sqlx::query(
                "SELECT * FROM trials
                 WHERE experiment_id = ?
                   AND status IN ('SUCCEEDED', 'FAILED', 'CANCELED', 'TIMED_OUT')
                 ORDER BY trial_id",
            )
            .bind(experiment_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            for row in &rows {
                let trial = self.trial_from_row(row)?;
                configs.push(trial.tunables.values());
                scores.push(extract_score(&trial, &self.spec.opt_target));
                statuses.push(trial.status);
            }
        }
        Ok((configs, scores, statuses))
    }

    async fn pending_trials(&self) -> Result<Vec<TrialRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM trials
             WHERE experiment_id = ?
               AND status NOT IN ('SUCCEEDED', 'FAILED', 'CANCELED', 'TIMED_OUT')
             ORDER BY trial_id",
        )
        .bind(&self.spec.experiment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(|row| self.trial_from_row(row)).collect()
    }

    async fn new_trial(&mut self, tunables: &TunableGroups) -> Result<TrialRecord> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let trial_id: i64 = sqlx::query(
            "SELECT COALESCE(MAX(trial_id), 0) + 1 AS next_id
             FROM trials WHERE experiment_id = ?",
        )
        .bind(&self.spec.experiment_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?
        .get("next_id");

        let trial = TrialRecord::new(&self.spec.experiment_id, trial_id as u64, tunables.clone());
        sqlx::query(
            "INSERT INTO trials
             (experiment_id, trial_id, status, config_hash, tunables_json, ts_start)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.spec.experiment_id)
        .bind(trial_id)
        .bind(trial.status.as_str())
        .bind(&trial.config_hash)
        .bind(trial.tunables.to_json().to_string())
        .bind(trial.ts_start.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        info!(experiment = self.spec.experiment_id, trial_id, "trial allocated");
        Ok(trial)
    }

    async fn update_trial(
        &mut self,
        trial_id: u64,
        status: Status,
        results: Option<&ParamDict>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let current = Self::fetch_status(&mut tx, &self.spec.experiment_id, trial_id).await?;
        if !TrialRecord::can_transition(current, status) {
            return Err(Error::storage(format!(
                "invalid trial transition: {current} -> {status}"
            )));
        }
        let results_json = results.map(serde_json::to_string).transpose()?;
        let ts_end = status.is_terminal().then(|| Utc::now().to_rfc3339());
        sqlx::query(
            "UPDATE trials SET status = ?, results_json = ?, ts_end = ?
             WHERE experiment_id = ? AND trial_id = ?",
        )
        .bind(status.as_str())
        .bind(results_json)
        .bind(ts_end)
        .bind(&self.spec.experiment_id)
        .bind(trial_id as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    async fn update_telemetry(
        &mut self,
        trial_id: u64,
        _status: Status,
        telemetry: Option<&ParamDict>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let current = Self::fetch_status(&mut tx, &self.spec.experiment_id, trial_id).await?;
        if current.is_terminal() {
            return Err(Error::storage("trial is already terminal".to_string()));
        }
        let telemetry_json = telemetry.map(serde_json::to_string).transpose()?;
        sqlx::query(
            "UPDATE trials SET telemetry_json = ?
             WHERE experiment_id = ? AND trial_id = ?",
        )
        .bind(telemetry_json)
        .bind(&self.spec.experiment_id)
        .bind(trial_id as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otto_core::ParamValue;
    use otto_tunables::{CovariantGroup, Tunable, TunableDef, TunableKind};

    fn tunables(x: i64) -> TunableGroups {
        let mut group = CovariantGroup::new("main", 1);
        let mut tunable = Tunable::new(
            "x",
            TunableDef {
                kind: TunableKind::Int,
                description: None,
                default: ParamValue::Int(0),
                values: None,
                range: Some((0.0, 100.0)),
                quantization: None,
                log: None,
                distribution: None,
                special: None,
                values_weights: None,
                special_weights: None,
                range_weight: None,
                meta: Default::default(),
            },
        )
        .unwrap();
        tunable.assign(x).unwrap();
        group.add(tunable).unwrap();
        let mut groups = TunableGroups::new();
        groups.add_group(group).unwrap();
        groups
    }

    fn row(score: f64) -> ParamDict {
        let mut row = ParamDict::new();
        row.insert("score".into(), ParamValue::Float(score));
        row
    }

    #[tokio::test]
    async fn test_sql_round_trip() {
        let storage = SqlStorage::connect("sqlite::memory:").await.unwrap();
        let space = tunables(0);
        let spec =
            ExperimentSpec::new("exp-sql", "env-hash", "score").with_param_space(&space);
        let mut scope = storage.experiment(spec.clone()).await.unwrap();

        let trial = scope.new_trial(&tunables(7)).await.unwrap();
        scope
            .update_trial(trial.trial_id, Status::Running, None)
            .await
            .unwrap();
        scope
            .update_telemetry(trial.trial_id, Status::Running, Some(&row(0.0)))
            .await
            .unwrap();
        scope
            .update_trial(trial.trial_id, Status::Succeeded, Some(&row(0.33)))
            .await
            .unwrap();
        scope.new_trial(&tunables(9)).await.unwrap();

        let (configs, scores, statuses) = scope.load().await.unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].get("x"), Some(&ParamValue::Int(7)));
        assert_eq!(scores, vec![Some(0.33)]);
        assert_eq!(statuses, vec![Status::Succeeded]);

        let pending = scope.pending_trials().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].trial_id, 2);
        assert_eq!(
            pending[0].tunables.get("x").unwrap().0.value(),
            &ParamValue::Int(9)
        );

        // Terminal trials are immutable here too.
        assert!(scope
            .update_trial(trial.trial_id, Status::Failed, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_sql_experiment_mismatch() {
        let storage = SqlStorage::connect("sqlite::memory:").await.unwrap();
        let space = tunables(0);
        let spec =
            ExperimentSpec::new("exp-sql", "env-hash", "score").with_param_space(&space);
        storage.experiment(spec.clone()).await.unwrap();
        let mut other = spec;
        other.root_env_hash = "different".into();
        assert!(matches!(
            storage.experiment(other).await,
            Err(Error::ExperimentMismatch { .. })
        ));
    }
}
