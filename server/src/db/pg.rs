//! Postgres-backed implementation of the repository traits (spec §4.1).
//! All writes happen inside the caller's transaction; every method here
//! takes `&PgPool` directly because sqlx's `Executor` abstracts over a
//! pool, a connection, or a transaction uniformly — callers that need a
//! single atomic unit acquire a `Transaction` and pass `&mut *txn`
//! through the settlement engine's executor parameter instead of calling
//! through this pool-bound struct (see `settlement::mod`).

use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::*;
use crate::db::repo::*;
use crate::error::{EngineError, Result};

#[derive(Clone)]
pub struct PgRepos {
    pub pool: PgPool,
}

impl PgRepos {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PrinterRepo for PgRepos {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Printer>> {
        let row = sqlx::query_as::<_, Printer>("SELECT * FROM printers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list(&self) -> Result<Vec<Printer>> {
        let rows = sqlx::query_as::<_, Printer>("SELECT * FROM printers ORDER BY serial")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn mark_seen(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE printers SET status = 'online', last_seen = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl RawEventRepo for PgRepos {
    async fn append(
        &self,
        printer_id: Uuid,
        topic: &str,
        payload: Json,
        content_hash: &str,
        received_at: DateTime<Utc>,
    ) -> Result<RawEvent> {
        let row = sqlx::query_as::<_, RawEvent>(
            r#"
            INSERT INTO raw_events (printer_id, topic, payload, content_hash, received_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(printer_id)
        .bind(topic)
        .bind(payload)
        .bind(content_hash)
        .bind(received_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }
}

impl NormalizedEventRepo for PgRepos {
    async fn insert_if_absent(
        &self,
        event_id: &str,
        printer_id: Uuid,
        kind: NormalizedEventType,
        occurred_at: DateTime<Utc>,
        payload: Json,
        raw_event_id: i64,
    ) -> Result<Option<NormalizedEvent>> {
        // `inserted` distinguishes "inserted" from "did nothing" per the
        // upsert-with-discriminator contract (spec §6).
        let row = sqlx::query_as::<_, NormalizedEvent>(
            r#"
            INSERT INTO normalized_events (event_id, printer_id, type, occurred_at, payload, raw_event_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(event_id)
        .bind(printer_id)
        .bind(kind)
        .bind(occurred_at)
        .bind(payload)
        .bind(raw_event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn page_after(&self, last_id: i64, limit: i64) -> Result<Vec<NormalizedEvent>> {
        let rows = sqlx::query_as::<_, NormalizedEvent>(
            "SELECT * FROM normalized_events WHERE id > $1 ORDER BY id ASC LIMIT $2",
        )
        .bind(last_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

impl JobRepo for PgRepos {
    async fn find_by_key(&self, printer_id: Uuid, job_key: &str) -> Result<Option<PrintJob>> {
        let row = sqlx::query_as::<_, PrintJob>(
            "SELECT * FROM print_jobs WHERE printer_id = $1 AND job_key = $2",
        )
        .bind(printer_id)
        .bind(job_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PrintJob>> {
        let row = sqlx::query_as::<_, PrintJob>("SELECT * FROM print_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn create(
        &self,
        printer_id: Uuid,
        job_key: Option<String>,
        file_name: Option<String>,
        status: JobStatus,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<PrintJob> {
        let row = sqlx::query_as::<_, PrintJob>(
            r#"
            INSERT INTO print_jobs (id, printer_id, job_key, file_name, status, started_at, snapshot, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, '{}'::jsonb, now(), now())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(printer_id)
        .bind(job_key)
        .bind(file_name)
        .bind(status)
        .bind(started_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn save(&self, job: &PrintJob) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE print_jobs SET
                file_name = $2, status = $3, started_at = $4, ended_at = $5,
                snapshot = $6, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(&job.file_name)
        .bind(job.status)
        .bind(job.started_at)
        .bind(job.ended_at)
        .bind(&job.snapshot)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_recent_stub_running(
        &self,
        printer_id: Uuid,
        since: DateTime<Utc>,
        exclude_id: Uuid,
    ) -> Result<Vec<PrintJob>> {
        let rows = sqlx::query_as::<_, PrintJob>(
            r#"
            SELECT * FROM print_jobs
            WHERE printer_id = $1 AND status = 'running' AND file_name IS NULL
              AND id != $2 AND started_at >= $3
            "#,
        )
        .bind(printer_id)
        .bind(exclude_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

impl StockRepo for PgRepos {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<MaterialStock>> {
        let row = sqlx::query_as::<_, MaterialStock>("SELECT * FROM material_stocks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_active_by_key(
        &self,
        material: &str,
        color: &str,
        brand: &str,
    ) -> Result<Vec<MaterialStock>> {
        let rows = sqlx::query_as::<_, MaterialStock>(
            "SELECT * FROM material_stocks WHERE material = $1 AND color = $2 AND brand = $3 AND is_archived = false",
        )
        .bind(material)
        .bind(color)
        .bind(brand)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_active_by_material_color_excluding_brand(
        &self,
        material: &str,
        color: &str,
        excluded_brand: &str,
    ) -> Result<Vec<MaterialStock>> {
        let rows = sqlx::query_as::<_, MaterialStock>(
            "SELECT * FROM material_stocks WHERE material = $1 AND color = $2 AND brand != $3 AND is_archived = false",
        )
        .bind(material)
        .bind(color)
        .bind(excluded_brand)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn save(&self, stock: &MaterialStock) -> Result<()> {
        sqlx::query(
            "UPDATE material_stocks SET remaining_grams = $2, is_archived = $3, archived_at = $4, updated_at = now() WHERE id = $1",
        )
        .bind(stock.id)
        .bind(stock.remaining_grams)
        .bind(stock.is_archived)
        .bind(stock.archived_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl LedgerRepo for PgRepos {
    async fn insert(&self, row: MaterialLedger) -> Result<MaterialLedger> {
        let out = sqlx::query_as::<_, MaterialLedger>(
            r#"
            INSERT INTO material_ledger (
                id, stock_id, job_id, delta_grams, kind, rolls_count, price_per_roll,
                price_total, reason, created_at, reversal_of_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now(), $10)
            RETURNING *
            "#,
        )
        .bind(row.id)
        .bind(row.stock_id)
        .bind(row.job_id)
        .bind(row.delta_grams)
        .bind(row.kind)
        .bind(row.rolls_count)
        .bind(row.price_per_roll)
        .bind(row.price_total)
        .bind(&row.reason)
        .bind(row.reversal_of_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(out)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<MaterialLedger>> {
        let row = sqlx::query_as::<_, MaterialLedger>("SELECT * FROM material_ledger WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_reversal_of(&self, target: Uuid) -> Result<Option<MaterialLedger>> {
        let row = sqlx::query_as::<_, MaterialLedger>(
            "SELECT * FROM material_ledger WHERE reversal_of_id = $1",
        )
        .bind(target)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn void(&self, id: Uuid, at: DateTime<Utc>, reason: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE material_ledger SET voided_at = $2, void_reason = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::LedgerRowNotFound(id));
        }
        Ok(())
    }

    async fn find_by_job_and_reason_substr(&self, job_id: Uuid, needle: &str) -> Result<Vec<MaterialLedger>> {
        let pattern = format!("%{needle}%");
        let rows = sqlx::query_as::<_, MaterialLedger>(
            "SELECT * FROM material_ledger WHERE job_id = $1 AND reason LIKE $2",
        )
        .bind(job_id)
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_by_stock(&self, stock_id: Uuid) -> Result<Vec<MaterialLedger>> {
        let rows = sqlx::query_as::<_, MaterialLedger>(
            "SELECT * FROM material_ledger WHERE stock_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(stock_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

impl ConsumptionRepo for PgRepos {
    async fn insert(&self, row: ConsumptionRecord) -> Result<ConsumptionRecord> {
        let out = sqlx::query_as::<_, ConsumptionRecord>(
            r#"
            INSERT INTO consumption_records (
                id, job_id, stock_id, tray_id, segment_idx, grams, grams_requested,
                grams_effective, source, confidence, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
            RETURNING *
            "#,
        )
        .bind(row.id)
        .bind(row.job_id)
        .bind(row.stock_id)
        .bind(row.tray_id)
        .bind(row.segment_idx)
        .bind(row.grams)
        .bind(row.grams_requested)
        .bind(row.grams_effective)
        .bind(&row.source)
        .bind(&row.confidence)
        .fetch_one(&self.pool)
        .await?;
        Ok(out)
    }

    async fn find_by_job_tray_segment(
        &self,
        job_id: Uuid,
        tray_id: i32,
        segment_idx: i32,
    ) -> Result<Option<ConsumptionRecord>> {
        let row = sqlx::query_as::<_, ConsumptionRecord>(
            "SELECT * FROM consumption_records WHERE job_id = $1 AND tray_id = $2 AND segment_idx = $3",
        )
        .bind(job_id)
        .bind(tray_id)
        .bind(segment_idx)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_by_stock(&self, stock_id: Uuid) -> Result<Vec<ConsumptionRecord>> {
        let rows = sqlx::query_as::<_, ConsumptionRecord>(
            "SELECT * FROM consumption_records WHERE stock_id = $1 AND voided_at IS NULL ORDER BY created_at ASC, id ASC",
        )
        .bind(stock_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_by_job(&self, job_id: Uuid) -> Result<Vec<ConsumptionRecord>> {
        let rows = sqlx::query_as::<_, ConsumptionRecord>(
            "SELECT * FROM consumption_records WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

impl AmsColorMappingRepo for PgRepos {
    async fn find_by_hex(&self, hex: &str) -> Result<Option<AmsColorMapping>> {
        let row = sqlx::query_as::<_, AmsColorMapping>(
            "SELECT * FROM ams_color_mappings WHERE color_hex = $1",
        )
        .bind(hex)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert_if_absent(&self, hex: &str, name: &str) -> Result<AmsColorMapping> {
        let row = sqlx::query_as::<_, AmsColorMapping>(
            r#"
            INSERT INTO ams_color_mappings (id, color_hex, color_name)
            VALUES ($1, $2, $3)
            ON CONFLICT (color_hex) DO UPDATE SET color_hex = EXCLUDED.color_hex
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(hex)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }
}
