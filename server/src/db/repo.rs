//! Repository traits, one per aggregate (Design Notes: replace ORM-bound
//! domain objects with plain records + a repository trait per aggregate).
//! The settlement engine is written against these traits so it can run
//! against either the Postgres-backed implementation or an in-memory
//! fake in tests.

use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use uuid::Uuid;

use crate::db::models::*;
use crate::error::Result;

pub trait PrinterRepo: Send + Sync {
    fn find_by_id(&self, id: Uuid) -> impl Future<Output = Result<Option<Printer>>> + Send;
    fn list(&self) -> impl Future<Output = Result<Vec<Printer>>> + Send;
    fn mark_seen(&self, id: Uuid, at: DateTime<Utc>) -> impl Future<Output = Result<()>> + Send;
}

pub trait RawEventRepo: Send + Sync {
    fn append(
        &self,
        printer_id: Uuid,
        topic: &str,
        payload: Json,
        content_hash: &str,
        received_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<RawEvent>> + Send;
}

pub trait NormalizedEventRepo: Send + Sync {
    /// Insert-on-conflict-do-nothing keyed by `event_id`. Returns `None`
    /// when the row already existed (at-least-once ingest → at-most-once
    /// persistence).
    fn insert_if_absent(
        &self,
        event_id: &str,
        printer_id: Uuid,
        kind: NormalizedEventType,
        occurred_at: DateTime<Utc>,
        payload: Json,
        raw_event_id: i64,
    ) -> impl Future<Output = Result<Option<NormalizedEvent>>> + Send;

    fn page_after(&self, last_id: i64, limit: i64) -> impl Future<Output = Result<Vec<NormalizedEvent>>> + Send;
}

pub trait JobRepo: Send + Sync {
    fn find_by_key(&self, printer_id: Uuid, job_key: &str) -> impl Future<Output = Result<Option<PrintJob>>> + Send;
    fn find_by_id(&self, id: Uuid) -> impl Future<Output = Result<Option<PrintJob>>> + Send;

    fn create(
        &self,
        printer_id: Uuid,
        job_key: Option<String>,
        file_name: Option<String>,
        status: JobStatus,
        started_at: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<PrintJob>> + Send;

    fn save(&self, job: &PrintJob) -> impl Future<Output = Result<()>> + Send;

    /// Running jobs with no file name, started within `since`, on `printer_id`,
    /// excluding `exclude_id` (spec §4.6.3 stub suppression).
    fn find_recent_stub_running(
        &self,
        printer_id: Uuid,
        since: DateTime<Utc>,
        exclude_id: Uuid,
    ) -> impl Future<Output = Result<Vec<PrintJob>>> + Send;
}

pub trait StockRepo: Send + Sync {
    fn find_by_id(&self, id: Uuid) -> impl Future<Output = Result<Option<MaterialStock>>> + Send;

    /// Active (non-archived) stocks matching `(material, color, brand)`.
    fn find_active_by_key(
        &self,
        material: &str,
        color: &str,
        brand: &str,
    ) -> impl Future<Output = Result<Vec<MaterialStock>>> + Send;

    /// Active stocks matching `(material, color)` excluding `brand`.
    fn find_active_by_material_color_excluding_brand(
        &self,
        material: &str,
        color: &str,
        excluded_brand: &str,
    ) -> impl Future<Output = Result<Vec<MaterialStock>>> + Send;

    fn save(&self, stock: &MaterialStock) -> impl Future<Output = Result<()>> + Send;
}

pub trait LedgerRepo: Send + Sync {
    fn insert(&self, row: MaterialLedger) -> impl Future<Output = Result<MaterialLedger>> + Send;
    fn find_by_id(&self, id: Uuid) -> impl Future<Output = Result<Option<MaterialLedger>>> + Send;
    fn find_reversal_of(&self, target: Uuid) -> impl Future<Output = Result<Option<MaterialLedger>>> + Send;
    fn void(&self, id: Uuid, at: DateTime<Utc>, reason: &str) -> impl Future<Output = Result<()>> + Send;

    /// Rows for `job_id` whose `reason` contains `needle` (idempotency
    /// probes for reservation/release/consumption, keyed by tray in the
    /// reason text per spec §4.6.5/§4.6.6).
    fn find_by_job_and_reason_substr(
        &self,
        job_id: Uuid,
        needle: &str,
    ) -> impl Future<Output = Result<Vec<MaterialLedger>>> + Send;

    fn find_by_stock(&self, stock_id: Uuid) -> impl Future<Output = Result<Vec<MaterialLedger>>> + Send;
}

pub trait ConsumptionRepo: Send + Sync {
    fn insert(&self, row: ConsumptionRecord) -> impl Future<Output = Result<ConsumptionRecord>> + Send;

    fn find_by_job_tray_segment(
        &self,
        job_id: Uuid,
        tray_id: i32,
        segment_idx: i32,
    ) -> impl Future<Output = Result<Option<ConsumptionRecord>>> + Send;

    fn find_by_stock(&self, stock_id: Uuid) -> impl Future<Output = Result<Vec<ConsumptionRecord>>> + Send;
    fn find_by_job(&self, job_id: Uuid) -> impl Future<Output = Result<Vec<ConsumptionRecord>>> + Send;
}

pub trait AmsColorMappingRepo: Send + Sync {
    fn find_by_hex(&self, hex: &str) -> impl Future<Output = Result<Option<AmsColorMapping>>> + Send;
    fn insert_if_absent(&self, hex: &str, name: &str) -> impl Future<Output = Result<AmsColorMapping>> + Send;
}
