//! In-memory repository fakes. The settlement engine is written against
//! the `*Repo` traits so it can be exercised here without a database
//! (Design Notes: testable against an in-memory repository).

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use uuid::Uuid;

use crate::db::models::*;
use crate::db::repo::*;
use crate::error::{EngineError, Result};

#[derive(Default)]
pub struct MemoryRepos {
    pub printers: Mutex<Vec<Printer>>,
    pub raw_events: Mutex<Vec<RawEvent>>,
    pub normalized_events: Mutex<Vec<NormalizedEvent>>,
    pub jobs: Mutex<Vec<PrintJob>>,
    pub stocks: Mutex<Vec<MaterialStock>>,
    pub ledger: Mutex<Vec<MaterialLedger>>,
    pub consumptions: Mutex<Vec<ConsumptionRecord>>,
    pub color_mappings: Mutex<Vec<AmsColorMapping>>,
    next_raw_id: Mutex<i64>,
    next_event_id: Mutex<i64>,
}

impl MemoryRepos {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_printer(&self, printer: Printer) {
        self.printers.lock().unwrap().push(printer);
    }

    pub fn seed_stock(&self, stock: MaterialStock) {
        self.stocks.lock().unwrap().push(stock);
    }
}

impl PrinterRepo for MemoryRepos {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Printer>> {
        Ok(self.printers.lock().unwrap().iter().find(|p| p.id == id).cloned())
    }

    async fn list(&self) -> Result<Vec<Printer>> {
        Ok(self.printers.lock().unwrap().clone())
    }

    async fn mark_seen(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut printers = self.printers.lock().unwrap();
        if let Some(p) = printers.iter_mut().find(|p| p.id == id) {
            p.status = "online".into();
            p.last_seen = Some(at);
        }
        Ok(())
    }
}

impl RawEventRepo for MemoryRepos {
    async fn append(
        &self,
        printer_id: Uuid,
        topic: &str,
        payload: Json,
        content_hash: &str,
        received_at: DateTime<Utc>,
    ) -> Result<RawEvent> {
        let mut next_id = self.next_raw_id.lock().unwrap();
        *next_id += 1;
        let row = RawEvent {
            id: *next_id,
            printer_id,
            topic: topic.to_string(),
            payload,
            content_hash: content_hash.to_string(),
            received_at,
        };
        self.raw_events.lock().unwrap().push(row.clone());
        Ok(row)
    }
}

impl NormalizedEventRepo for MemoryRepos {
    async fn insert_if_absent(
        &self,
        event_id: &str,
        printer_id: Uuid,
        kind: NormalizedEventType,
        occurred_at: DateTime<Utc>,
        payload: Json,
        raw_event_id: i64,
    ) -> Result<Option<NormalizedEvent>> {
        let mut events = self.normalized_events.lock().unwrap();
        if events.iter().any(|e| e.event_id == event_id) {
            return Ok(None);
        }
        let mut next_id = self.next_event_id.lock().unwrap();
        *next_id += 1;
        let row = NormalizedEvent {
            id: *next_id,
            event_id: event_id.to_string(),
            printer_id,
            kind,
            occurred_at,
            payload,
            raw_event_id,
        };
        events.push(row.clone());
        Ok(Some(row))
    }

    async fn page_after(&self, last_id: i64, limit: i64) -> Result<Vec<NormalizedEvent>> {
        let mut events: Vec<_> = self
            .normalized_events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.id > last_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.id);
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }
}

impl JobRepo for MemoryRepos {
    async fn find_by_key(&self, printer_id: Uuid, job_key: &str) -> Result<Option<PrintJob>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.printer_id == printer_id && j.job_key.as_deref() == Some(job_key))
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PrintJob>> {
        Ok(self.jobs.lock().unwrap().iter().find(|j| j.id == id).cloned())
    }

    async fn create(
        &self,
        printer_id: Uuid,
        job_key: Option<String>,
        file_name: Option<String>,
        status: JobStatus,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<PrintJob> {
        let now = Utc::now();
        let job = PrintJob {
            id: Uuid::new_v4(),
            printer_id,
            job_key,
            file_name,
            status,
            started_at,
            ended_at: None,
            snapshot: Json::Object(Default::default()),
            created_at: now,
            updated_at: now,
        };
        self.jobs.lock().unwrap().push(job.clone());
        Ok(job)
    }

    async fn save(&self, job: &PrintJob) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(slot) = jobs.iter_mut().find(|j| j.id == job.id) {
            *slot = job.clone();
            slot.updated_at = Utc::now();
            Ok(())
        } else {
            Err(EngineError::JobNotFound(job.id))
        }
    }

    async fn find_recent_stub_running(
        &self,
        printer_id: Uuid,
        since: DateTime<Utc>,
        exclude_id: Uuid,
    ) -> Result<Vec<PrintJob>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| {
                j.printer_id == printer_id
                    && j.status == JobStatus::Running
                    && j.file_name.is_none()
                    && j.id != exclude_id
                    && j.started_at.is_some_and(|s| s >= since)
            })
            .cloned()
            .collect())
    }
}

impl StockRepo for MemoryRepos {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<MaterialStock>> {
        Ok(self.stocks.lock().unwrap().iter().find(|s| s.id == id).cloned())
    }

    async fn find_active_by_key(&self, material: &str, color: &str, brand: &str) -> Result<Vec<MaterialStock>> {
        Ok(self
            .stocks
            .lock()
            .unwrap()
            .iter()
            .filter(|s| !s.is_archived && s.material == material && s.color == color && s.brand == brand)
            .cloned()
            .collect())
    }

    async fn find_active_by_material_color_excluding_brand(
        &self,
        material: &str,
        color: &str,
        excluded_brand: &str,
    ) -> Result<Vec<MaterialStock>> {
        Ok(self
            .stocks
            .lock()
            .unwrap()
            .iter()
            .filter(|s| !s.is_archived && s.material == material && s.color == color && s.brand != excluded_brand)
            .cloned()
            .collect())
    }

    async fn save(&self, stock: &MaterialStock) -> Result<()> {
        let mut stocks = self.stocks.lock().unwrap();
        if let Some(slot) = stocks.iter_mut().find(|s| s.id == stock.id) {
            *slot = stock.clone();
            Ok(())
        } else {
            Err(EngineError::StockNotFound(stock.id))
        }
    }
}

impl LedgerRepo for MemoryRepos {
    async fn insert(&self, mut row: MaterialLedger) -> Result<MaterialLedger> {
        if row.id.is_nil() {
            row.id = Uuid::new_v4();
        }
        self.ledger.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<MaterialLedger>> {
        Ok(self.ledger.lock().unwrap().iter().find(|l| l.id == id).cloned())
    }

    async fn find_reversal_of(&self, target: Uuid) -> Result<Option<MaterialLedger>> {
        Ok(self
            .ledger
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.reversal_of_id == Some(target))
            .cloned())
    }

    async fn void(&self, id: Uuid, at: DateTime<Utc>, reason: &str) -> Result<()> {
        let mut ledger = self.ledger.lock().unwrap();
        let row = ledger
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or(EngineError::LedgerRowNotFound(id))?;
        row.voided_at = Some(at);
        row.void_reason = Some(reason.to_string());
        Ok(())
    }

    async fn find_by_job_and_reason_substr(&self, job_id: Uuid, needle: &str) -> Result<Vec<MaterialLedger>> {
        Ok(self
            .ledger
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.job_id == Some(job_id) && l.reason.as_deref().is_some_and(|r| r.contains(needle)))
            .cloned()
            .collect())
    }

    async fn find_by_stock(&self, stock_id: Uuid) -> Result<Vec<MaterialLedger>> {
        let mut rows: Vec<_> = self
            .ledger
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.stock_id == Some(stock_id))
            .cloned()
            .collect();
        rows.sort_by_key(|l| l.created_at);
        Ok(rows)
    }
}

impl ConsumptionRepo for MemoryRepos {
    async fn insert(&self, mut row: ConsumptionRecord) -> Result<ConsumptionRecord> {
        if row.id.is_nil() {
            row.id = Uuid::new_v4();
        }
        self.consumptions.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn find_by_job_tray_segment(
        &self,
        job_id: Uuid,
        tray_id: i32,
        segment_idx: i32,
    ) -> Result<Option<ConsumptionRecord>> {
        Ok(self
            .consumptions
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.job_id == Some(job_id) && c.tray_id == Some(tray_id) && c.segment_idx == Some(segment_idx))
            .cloned())
    }

    async fn find_by_stock(&self, stock_id: Uuid) -> Result<Vec<ConsumptionRecord>> {
        Ok(self
            .consumptions
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.stock_id == Some(stock_id) && c.voided_at.is_none())
            .cloned()
            .collect())
    }

    async fn find_by_job(&self, job_id: Uuid) -> Result<Vec<ConsumptionRecord>> {
        Ok(self
            .consumptions
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.job_id == Some(job_id))
            .cloned()
            .collect())
    }
}

impl AmsColorMappingRepo for MemoryRepos {
    async fn find_by_hex(&self, hex: &str) -> Result<Option<AmsColorMapping>> {
        Ok(self
            .color_mappings
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.color_hex == hex)
            .cloned())
    }

    async fn insert_if_absent(&self, hex: &str, name: &str) -> Result<AmsColorMapping> {
        let mut mappings = self.color_mappings.lock().unwrap();
        if let Some(existing) = mappings.iter().find(|m| m.color_hex == hex) {
            return Ok(existing.clone());
        }
        let row = AmsColorMapping {
            id: Uuid::new_v4(),
            color_hex: hex.to_string(),
            color_name: name.to_string(),
        };
        mappings.push(row.clone());
        Ok(row)
    }
}
