//! Typed `PrintJob.snapshot` (spec §3): deserialized once at the start of
//! event processing, mutated in place through `&mut JobSnapshot` as the
//! job progresses, and reserialized once on persist — the same
//! single-document, mutate-then-persist shape the source's live ORM
//! session uses, rebuilt here as a plain record detached from any session
//! object.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrayMeta {
    pub material: Option<String>,
    pub color: Option<String>,
    pub color_hex: Option<String>,
    pub color_hex_raw: Option<String>,
    pub is_official: bool,
    /// `remain` as first observed for this tray in this job, with its
    /// unit tag, used for the start/end-remain settlement fallback
    /// (spec §4.6.6 step 2, last tier).
    pub start_remain: Option<f64>,
    pub start_remain_unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConsumption {
    pub tray_id: i32,
    pub segment_idx: i32,
    pub unit: String,
    pub grams_requested: f64,
    pub source: String,
    pub confidence: String,
    #[serde(default)]
    pub metadata: Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSnapshot {
    pub mode: String,
    pub tray_to_stock: BTreeMap<String, Uuid>,
    pub tray_now: Option<i32>,
    pub trays_seen: Vec<i32>,
    pub tray_meta_by_tray: BTreeMap<String, TrayMeta>,
    pub pending_trays: Vec<i32>,
    pub pending_consumptions: Vec<PendingConsumption>,
    pub reserved_by_tray: BTreeMap<String, i64>,
    pub reserved_stock_by_tray: BTreeMap<String, Uuid>,
    pub reserved_source: Option<String>,
    pub reserved_confidence: Option<String>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub reservation_release_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub settle_error: Option<String>,
}

impl JobSnapshot {
    pub fn new() -> Self {
        Self {
            mode: "stock".to_string(),
            ..Default::default()
        }
    }

    pub fn from_json(value: &Json) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| Self::new())
    }

    pub fn to_json(&self) -> Json {
        serde_json::to_value(self).unwrap_or(Json::Null)
    }
}
