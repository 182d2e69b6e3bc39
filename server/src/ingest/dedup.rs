//! Progress-event dedupe signature (spec §4.5 step 5). Grounded in the
//! normalization module's own signature helpers; generalized here into a
//! per-printer "last observed signature" cache so the consumer loop can
//! decide, event by event, whether a `PrintProgress` frame is a repeat.

use std::collections::HashMap;

use uuid::Uuid;

use crate::normalize::{ams_signature, estimate_signature, filament_signature, NormalizedData};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProgressSignature {
    gcode_state: Option<String>,
    progress: Option<i32>,
    ams: String,
    filament: String,
    estimate: String,
}

fn signature(data: &NormalizedData, has_estimate: bool, estimate_key: Option<&str>) -> ProgressSignature {
    ProgressSignature {
        gcode_state: data.gcode_state.clone(),
        progress: data.progress,
        ams: ams_signature(data),
        filament: filament_signature(data),
        estimate: estimate_signature(has_estimate, estimate_key),
    }
}

/// Per-printer cache of the most recent 5-tuple signature. Lives for the
/// lifetime of the consumer loop; a process restart simply re-admits the
/// next progress event for each printer, which is harmless (the unique
/// `event_id` still guards storage).
#[derive(Default)]
pub struct DedupeCache {
    last: HashMap<Uuid, ProgressSignature>,
}

impl DedupeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` iff this is a `PrintProgress` frame whose 5-tuple
    /// signature matches the last one recorded for `printer_id`. Always
    /// updates the cache with the newest signature, regardless of the
    /// event's own type, so a later progress frame is compared against
    /// the most recent state seen for the printer.
    pub fn is_duplicate_progress(
        &mut self,
        printer_id: Uuid,
        is_progress: bool,
        data: &NormalizedData,
        has_estimate: bool,
        estimate_key: Option<&str>,
    ) -> bool {
        let sig = signature(data, has_estimate, estimate_key);
        let duplicate = is_progress && self.last.get(&printer_id) == Some(&sig);
        self.last.insert(printer_id, sig);
        duplicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(gcode_state: &str, progress: i32) -> NormalizedData {
        NormalizedData {
            gcode_state: Some(gcode_state.to_string()),
            progress: Some(progress),
            mc_remaining_time: None,
            gcode_file: None,
            gcode_start_time: None,
            task_id: None,
            subtask_id: None,
            subtask_name: None,
            tray_now: None,
            ams_trays: vec![],
            filament: vec![],
        }
    }

    #[test]
    fn repeated_progress_is_duplicate() {
        let mut cache = DedupeCache::new();
        let printer = Uuid::new_v4();
        assert!(!cache.is_duplicate_progress(printer, true, &data("RUNNING", 10), false, None));
        assert!(cache.is_duplicate_progress(printer, true, &data("RUNNING", 10), false, None));
    }

    #[test]
    fn progress_change_is_not_duplicate() {
        let mut cache = DedupeCache::new();
        let printer = Uuid::new_v4();
        assert!(!cache.is_duplicate_progress(printer, true, &data("RUNNING", 10), false, None));
        assert!(!cache.is_duplicate_progress(printer, true, &data("RUNNING", 11), false, None));
    }

    #[test]
    fn non_progress_event_is_never_a_duplicate() {
        let mut cache = DedupeCache::new();
        let printer = Uuid::new_v4();
        assert!(!cache.is_duplicate_progress(printer, false, &data("RUNNING", 10), false, None));
        assert!(!cache.is_duplicate_progress(printer, false, &data("RUNNING", 10), false, None));
    }

    #[test]
    fn newly_arrived_estimate_breaks_dedupe() {
        let mut cache = DedupeCache::new();
        let printer = Uuid::new_v4();
        assert!(!cache.is_duplicate_progress(printer, true, &data("RUNNING", 10), false, None));
        assert!(!cache.is_duplicate_progress(printer, true, &data("RUNNING", 10), true, Some("job-1")));
    }
}
