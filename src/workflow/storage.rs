/// SQLite persistence layer for flows, runs and run steps
///
/// Implements the storage collaborator traits on top of a sqlx connection
/// pool. Flow definitions are stored as JSON text; step inputs/outputs are
/// JSON columns written on every transition.

use crate::workflow::{
    run::{PlannedStep, Run, RunStatus, RunStep, StepStatus, StepUpdate},
    store::{Credential, CredentialStore, FlowStore, RunStore},
    types::FlowRecord,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use std::str::FromStr;

/// SQLite-backed store for flows, runs, steps and credentials
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create new storage instance with an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a database URL, creating the file if missing, and ensure the schema
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// Private in-memory database (single connection so every query sees it)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// Initialize the schema
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition JSON NOT NULL,
                archived INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                log TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS run_steps (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                step_key TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                node_id TEXT,
                node_type TEXT,
                inputs_json JSON,
                outputs_json JSON,
                log TEXT,
                error TEXT,
                started_at TEXT,
                finished_at TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_run_steps_run ON run_steps(run_id, step_key)",
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                encrypted_payload TEXT NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Store a new flow or update an existing one
    pub async fn save_flow(&self, record: &FlowRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO flows (id, name, definition, archived, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                archived = excluded.archived,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.definition)
        .bind(record.archived)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn save_credential(&self, credential: &Credential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (id, provider, encrypted_payload)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                provider = excluded.provider,
                encrypted_payload = excluded.encrypted_payload
            "#,
        )
        .bind(&credential.id)
        .bind(&credential.provider)
        .bind(&credential.encrypted_payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT id, flow_id, status, workflow_id, log FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<Run> {
            let status: String = row.get("status");
            Ok(Run {
                id: row.get("id"),
                flow_id: row.get("flow_id"),
                status: RunStatus::parse(&status)
                    .ok_or_else(|| anyhow::anyhow!("Unknown run status: {}", status))?,
                workflow_id: row.get("workflow_id"),
                log: row.get("log"),
            })
        })
        .transpose()
    }

    /// Steps of a run ordered by step key
    pub async fn list_steps(&self, run_id: &str) -> Result<Vec<RunStep>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, step_key, name, status, node_id, node_type,
                   inputs_json, outputs_json, log, error, started_at, finished_at
            FROM run_steps WHERE run_id = ?
            ORDER BY length(step_key), step_key
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(step_from_row).collect()
    }
}

fn step_from_row(row: &SqliteRow) -> Result<RunStep> {
    let status: String = row.get("status");
    Ok(RunStep {
        id: row.get("id"),
        run_id: row.get("run_id"),
        step_key: row.get("step_key"),
        name: row.get("name"),
        status: StepStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("Unknown step status: {}", status))?,
        node_id: row.get("node_id"),
        node_type: row.get("node_type"),
        inputs: parse_json_column(row.get("inputs_json"))?,
        outputs: parse_json_column(row.get("outputs_json"))?,
        log: row.get("log"),
        error: row.get("error"),
        started_at: parse_time_column(row.get("started_at"))?,
        finished_at: parse_time_column(row.get("finished_at"))?,
    })
}

fn parse_json_column(raw: Option<String>) -> Result<Option<Value>> {
    raw.map(|text| serde_json::from_str(&text).map_err(Into::into))
        .transpose()
}

fn parse_time_column(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|text| {
        DateTime::parse_from_rfc3339(&text)
            .map(|t| t.with_timezone(&Utc))
            .map_err(Into::into)
    })
    .transpose()
}

#[async_trait]
impl FlowStore for SqliteStore {
    async fn load_flow_definition(&self, flow_id: &str) -> Result<String> {
        let row = sqlx::query("SELECT definition FROM flows WHERE id = ?")
            .bind(flow_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row.get("definition")),
            None => Err(anyhow::anyhow!("Flow not found: {}", flow_id)),
        }
    }

    async fn list_flows(&self) -> Result<Vec<FlowRecord>> {
        let rows = sqlx::query("SELECT id, name, definition, archived FROM flows ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| FlowRecord {
                id: row.get("id"),
                name: row.get("name"),
                archived: row.get("archived"),
                definition: row.get("definition"),
            })
            .collect())
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn create_run(&self, flow_id: &str, workflow_id: &str) -> Result<Run> {
        let run = Run {
            id: uuid::Uuid::new_v4().to_string(),
            flow_id: flow_id.to_string(),
            status: RunStatus::Queued,
            workflow_id: workflow_id.to_string(),
            log: String::new(),
        };

        sqlx::query("INSERT INTO runs (id, flow_id, status, workflow_id, log) VALUES (?, ?, ?, ?, '')")
            .bind(&run.id)
            .bind(&run.flow_id)
            .bind(run.status.as_str())
            .bind(&run.workflow_id)
            .execute(&self.pool)
            .await?;

        Ok(run)
    }

    async fn create_steps(&self, run_id: &str, steps: &[PlannedStep]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO run_steps (id, run_id, step_key, name, status, node_id, node_type)
                VALUES (?, ?, ?, ?, 'queued', ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    step_key = excluded.step_key,
                    name = excluded.name,
                    status = 'queued',
                    node_id = excluded.node_id,
                    node_type = excluded.node_type,
                    inputs_json = NULL,
                    outputs_json = NULL,
                    log = NULL,
                    error = NULL,
                    started_at = NULL,
                    finished_at = NULL
                "#,
            )
            .bind(&step.step_id)
            .bind(run_id)
            .bind(&step.step_key)
            .bind(&step.name)
            .bind(&step.node_id)
            .bind(&step.node_type)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn update_step_state(&self, update: StepUpdate) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let started_at = (update.status == StepStatus::Running).then(|| now.clone());
        let finished_at = update.status.is_terminal().then_some(now);
        let inputs = update.inputs.as_ref().map(Value::to_string);
        let outputs = update.outputs.as_ref().map(Value::to_string);

        let result = sqlx::query(
            r#"
            UPDATE run_steps SET
                status = ?,
                inputs_json = COALESCE(?, inputs_json),
                outputs_json = COALESCE(?, outputs_json),
                log = COALESCE(?, log),
                error = COALESCE(?, error),
                started_at = COALESCE(?, started_at),
                finished_at = COALESCE(?, finished_at)
            WHERE id = ?
            "#,
        )
        .bind(update.status.as_str())
        .bind(inputs)
        .bind(outputs)
        .bind(&update.log)
        .bind(&update.error)
        .bind(started_at)
        .bind(finished_at)
        .bind(&update.step_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow::anyhow!("Step not found: {}", update.step_id));
        }

        Ok(())
    }

    async fn cancel_open_steps(&self, run_id: &str, message: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE run_steps SET
                status = 'canceled',
                error = ?,
                finished_at = ?
            WHERE run_id = ? AND status IN ('queued', 'running')
            "#,
        )
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus, log: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE runs SET status = ?, log = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(log)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow::anyhow!("Run not found: {}", run_id));
        }

        Ok(())
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn get(&self, credential_id: &str) -> Result<Option<Credential>> {
        let row = sqlx::query("SELECT id, provider, encrypted_payload FROM credentials WHERE id = ?")
            .bind(credential_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| Credential {
            id: row.get("id"),
            provider: row.get("provider"),
            encrypted_payload: row.get("encrypted_payload"),
        }))
    }
}
