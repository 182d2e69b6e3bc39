//! Row structs for every entity in spec §3. Plain data records, not
//! ORM-bound objects (Design Notes: replace ORM row mapper with plain
//! records + repository traits per aggregate).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Printer {
    pub id: Uuid,
    pub ip: String,
    pub serial: String,
    pub lan_access_code_enc: String,
    pub status: String,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: i64,
    pub printer_id: Uuid,
    pub topic: String,
    pub payload: Json,
    pub content_hash: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum NormalizedEventType {
    PrintStarted,
    PrintProgress,
    PrintEnded,
    PrintFailed,
    StateChanged,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub id: i64,
    pub event_id: String,
    pub printer_id: Uuid,
    #[sqlx(rename = "type")]
    pub kind: NormalizedEventType,
    pub occurred_at: DateTime<Utc>,
    pub payload: Json,
    pub raw_event_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum JobStatus {
    Unknown,
    Running,
    Ended,
    Failed,
    Cancelled,
    Manual,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: Uuid,
    pub printer_id: Uuid,
    pub job_key: Option<String>,
    pub file_name: Option<String>,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub snapshot: Json,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct MaterialStock {
    pub id: Uuid,
    pub material: String,
    pub color: String,
    pub brand: String,
    pub roll_weight_grams: i64,
    pub remaining_grams: i64,
    pub is_archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum LedgerKind {
    Purchase,
    Adjustment,
    Consumption,
    Reservation,
    ReservationRelease,
    Reversal,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct MaterialLedger {
    pub id: Uuid,
    pub stock_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    pub delta_grams: i64,
    pub kind: LedgerKind,
    pub rolls_count: Option<i32>,
    pub price_per_roll: Option<f64>,
    pub price_total: Option<f64>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub voided_at: Option<DateTime<Utc>>,
    pub void_reason: Option<String>,
    pub reversal_of_id: Option<Uuid>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub stock_id: Option<Uuid>,
    pub tray_id: Option<i32>,
    pub segment_idx: Option<i32>,
    pub grams: i64,
    pub grams_requested: i64,
    pub grams_effective: i64,
    pub source: String,
    pub confidence: String,
    pub created_at: DateTime<Utc>,
    pub voided_at: Option<DateTime<Utc>>,
    pub void_reason: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct AmsColorMapping {
    pub id: Uuid,
    pub color_hex: String,
    pub color_name: String,
}
