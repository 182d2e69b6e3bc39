//! Event Processor — the settlement engine (spec §4.6). Grounded in
//! `original_source/backend/app/services/event_processor.py`'s tick
//! loop, job-key derivation, and lifecycle state machine, rebuilt around
//! the repository traits instead of a live ORM session so it runs
//! identically against Postgres or the in-memory fakes.

pub mod resolve;
pub mod reservation;
pub mod snapshot;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::db::models::{JobStatus, NormalizedEvent, NormalizedEventType};
use crate::db::repo::{AmsColorMappingRepo, ConsumptionRepo, JobRepo, LedgerRepo, NormalizedEventRepo, StockRepo};
use crate::error::Result;
use crate::normalize::NormalizedData;

use snapshot::JobSnapshot;

/// Aggregates every repository trait the settlement engine needs. Both
/// [`crate::db::pg::PgRepos`] and [`crate::db::memory::MemoryRepos`]
/// satisfy it automatically.
pub trait EngineRepos: JobRepo + StockRepo + LedgerRepo + ConsumptionRepo + AmsColorMappingRepo + NormalizedEventRepo {}
impl<T> EngineRepos for T where T: JobRepo + StockRepo + LedgerRepo + ConsumptionRepo + AmsColorMappingRepo + NormalizedEventRepo {}

const STUB_LOOKBACK: Duration = Duration::minutes(10);
const BATCH_SIZE: i64 = 500;

pub struct EventProcessor<R: EngineRepos> {
    repos: R,
    ams_calibration_enabled: bool,
    last_processed_id: i64,
}

impl<R: EngineRepos> EventProcessor<R> {
    pub fn new(repos: R, ams_calibration_enabled: bool) -> Self {
        EventProcessor {
            repos,
            ams_calibration_enabled,
            last_processed_id: 0,
        }
    }

    /// The underlying repository handle, for callers that need to seed
    /// or inspect state alongside `tick` (tests, administrative tools).
    pub fn repos(&self) -> &R {
        &self.repos
    }

    /// Processes up to [`BATCH_SIZE`] pending normalized events. Returns
    /// the number processed. A single event's failure is logged and does
    /// not advance the cursor past it within this tick (spec §4.6: "on
    /// exception, log and continue").
    pub async fn tick(&mut self) -> Result<usize> {
        let events = self.repos.page_after(self.last_processed_id, BATCH_SIZE).await?;
        let mut processed = 0;
        for event in &events {
            match self.process_event(event).await {
                Ok(()) => {
                    self.last_processed_id = event.id;
                    processed += 1;
                }
                Err(e) => {
                    tracing::error!(event_id = event.id, error = %e, "settlement event failed, continuing");
                    self.last_processed_id = event.id;
                }
            }
        }
        Ok(processed)
    }

    async fn process_event(&self, event: &NormalizedEvent) -> Result<()> {
        let Some(data) = serde_json::from_value::<NormalizedData>(event.payload.clone()).ok() else {
            return Ok(());
        };

        let job_key = derive_job_key(event.printer_id, &data, event.occurred_at);
        let mut job = match self.repos.find_by_key(event.printer_id, &job_key).await? {
            Some(job) => job,
            None => {
                let status = next_status(JobStatus::Unknown, event.kind, data.gcode_state.as_deref());
                let started_at = (status == JobStatus::Running).then_some(event.occurred_at);
                self.repos
                    .create(event.printer_id, Some(job_key), data.gcode_file.clone(), status, started_at)
                    .await?
            }
        };

        if job.status == JobStatus::Manual {
            return Ok(());
        }

        if data.task_id.is_some() && data.gcode_file.is_some() {
            self.suppress_stub_jobs(event.printer_id, event.occurred_at, job.id).await?;
        }

        let mut snapshot = JobSnapshot::from_json(&job.snapshot);

        if job.file_name.is_none() && data.gcode_file.is_some() {
            job.file_name = data.gcode_file.clone();
        }

        self.seed_trays(&data, &mut snapshot).await?;

        let previous_status = job.status;
        job.status = next_status(previous_status, event.kind, data.gcode_state.as_deref());
        if previous_status != JobStatus::Running && job.status == JobStatus::Running && job.started_at.is_none() {
            job.started_at = Some(event.occurred_at);
        }

        reservation::try_reserve(&self.repos, &self.repos, job.id, &data, &mut snapshot).await?;

        let terminal = matches!(job.status, JobStatus::Ended | JobStatus::Failed | JobStatus::Cancelled);
        if terminal && snapshot.settled_at.is_none() {
            job.ended_at.get_or_insert(event.occurred_at);
            let settle_result = reservation::settle_terminal(
                &self.repos,
                &self.repos,
                &self.repos,
                job.id,
                &data,
                &mut snapshot,
                job.status == JobStatus::Cancelled,
                self.ams_calibration_enabled,
            )
            .await;
            if let Err(e) = settle_result {
                snapshot.settle_error = Some(e.to_string());
            }
        }

        job.snapshot = snapshot.to_json();
        JobRepo::save(&self.repos, &job).await?;
        Ok(())
    }

    async fn seed_trays(&self, data: &NormalizedData, snapshot: &mut JobSnapshot) -> Result<()> {
        snapshot.tray_now = data.tray_now;
        for tray in &data.ams_trays {
            if !snapshot.trays_seen.contains(&tray.id) {
                snapshot.trays_seen.push(tray.id);
            }

            let already_resolved = snapshot.tray_to_stock.contains_key(&tray.id.to_string());
            let (meta, resolved) = resolve::resolve_tray(&self.repos, &self.repos, tray).await?;

            // Preserve the first-seen remain for the calibration fallback;
            // later events only refresh the descriptive metadata.
            let meta = match snapshot.tray_meta_by_tray.get(&tray.id.to_string()) {
                Some(existing) if existing.start_remain.is_some() => snapshot::TrayMeta {
                    start_remain: existing.start_remain,
                    start_remain_unit: existing.start_remain_unit.clone(),
                    ..meta
                },
                _ => meta,
            };
            snapshot.tray_meta_by_tray.insert(tray.id.to_string(), meta);

            if !already_resolved {
                if let Some(stock_id) = resolved {
                    snapshot.tray_to_stock.insert(tray.id.to_string(), stock_id);
                    snapshot.pending_trays.retain(|t| *t != tray.id);
                } else if !snapshot.pending_trays.contains(&tray.id) {
                    snapshot.pending_trays.push(tray.id);
                }
            }
        }
        Ok(())
    }

    async fn suppress_stub_jobs(&self, printer_id: Uuid, occurred_at: DateTime<Utc>, exclude_id: Uuid) -> Result<()> {
        let since = occurred_at - STUB_LOOKBACK;
        let stubs = self.repos.find_recent_stub_running(printer_id, since, exclude_id).await?;
        for mut stub in stubs {
            stub.status = JobStatus::Ended;
            stub.ended_at.get_or_insert(occurred_at);
            let mut snap = JobSnapshot::from_json(&stub.snapshot);
            snap.settle_error = Some("superseded_stub_job".to_string());
            snap.settled_at = Some(occurred_at);
            stub.snapshot = snap.to_json();
            JobRepo::save(&self.repos, &stub).await?;
        }
        Ok(())
    }
}

/// First available of the three identity tiers (spec §4.6.1).
pub fn derive_job_key(printer_id: Uuid, data: &NormalizedData, occurred_at: DateTime<Utc>) -> String {
    if let Some(task_id) = data.task_id.as_deref().or(data.subtask_id.as_deref()) {
        return format!("{printer_id}:{task_id}");
    }
    if let (Some(start), Some(file)) = (data.gcode_start_time, data.gcode_file.as_deref()) {
        return format!("{printer_id}:{start}:{file}");
    }
    let file = data.gcode_file.as_deref().unwrap_or("unknown");
    format!("{printer_id}:{}:{file}", occurred_at.timestamp())
}

/// Job status transition table (spec §4.6.2). Manual jobs and already-
/// terminal jobs never transition automatically.
pub fn next_status(current: JobStatus, kind: NormalizedEventType, gcode_state: Option<&str>) -> JobStatus {
    match current {
        JobStatus::Unknown => {
            if kind == NormalizedEventType::PrintStarted || gcode_state == Some("RUNNING") {
                JobStatus::Running
            } else {
                JobStatus::Unknown
            }
        }
        JobStatus::Running => {
            if kind == NormalizedEventType::PrintEnded || matches!(gcode_state, Some("FINISH") | Some("IDLE")) {
                JobStatus::Ended
            } else if gcode_state == Some("CANCELED") {
                // `derive_event_type` classifies every CANCELED frame as
                // PrintFailed (spec §4.5's own table has no separate
                // canceled event kind), so this gcode_state check must run
                // before the kind-based FAILED branch below or cancellation
                // is unreachable and settle_terminal never sees cancelled=true.
                JobStatus::Cancelled
            } else if kind == NormalizedEventType::PrintFailed || matches!(gcode_state, Some("FAILED") | Some("STOPPED")) {
                JobStatus::Failed
            } else {
                JobStatus::Running
            }
        }
        other => other,
    }
}
