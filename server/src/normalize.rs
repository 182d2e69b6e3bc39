//! Pure payload → normalized event conversion (spec §4.4). Grounded in
//! `original_source/collector/collector/main.py`'s
//! `_normalize_event_from_payload`, generalized to flatten both AMS tray
//! layouts and to carry the raw hex alongside the canonical color (the
//! Open Question decision recorded in DESIGN.md).

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemainUnit {
    #[default]
    Fraction,
    Percent,
    Grams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTray {
    pub id: i32,
    #[serde(rename = "type")]
    pub material: Option<String>,
    pub color_hex: Option<String>,
    pub color_hex_raw: Option<String>,
    pub remain: Option<f64>,
    #[serde(skip)]
    pub remain_unit: Option<RemainUnit>,
    pub tag_uid: Option<String>,
    pub tray_uuid: Option<String>,
    pub tray_id_name: Option<String>,
}

impl NormalizedTray {
    /// Heuristic: an official (first-party) tray carries RFID identity.
    pub fn is_official(&self) -> bool {
        non_empty(&self.tag_uid) || non_empty(&self.tray_uuid) || non_empty(&self.tray_id_name)
    }
}

fn non_empty(v: &Option<String>) -> bool {
    v.as_deref().is_some_and(|s| !s.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedFilament {
    pub tray_id: Option<i32>,
    #[serde(rename = "type")]
    pub material: Option<String>,
    pub color_hex: Option<String>,
    pub used_mm: Option<f64>,
    pub total_mm: Option<f64>,
    pub used_g: Option<f64>,
    pub total_g: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedData {
    pub gcode_state: Option<String>,
    pub progress: Option<i32>,
    pub mc_remaining_time: Option<i64>,
    pub gcode_file: Option<String>,
    pub gcode_start_time: Option<i64>,
    pub task_id: Option<String>,
    pub subtask_id: Option<String>,
    pub subtask_name: Option<String>,
    pub tray_now: Option<i32>,
    pub ams_trays: Vec<NormalizedTray>,
    pub filament: Vec<NormalizedFilament>,
}

/// Resolves the 8-digit RRGGBBAA/AARRGGBB ambiguity per spec §4.4, and
/// returns `(canonical, raw)` so callers can keep the original string for
/// later correction.
pub fn normalize_color_hex(raw: &str) -> Option<(String, String)> {
    let raw_trim = raw.trim();
    if raw_trim.is_empty() {
        return None;
    }
    let stripped = raw_trim.strip_prefix('#').unwrap_or(raw_trim);
    let upper = stripped.to_ascii_uppercase();
    if !upper.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let canonical_hex = match upper.len() {
        6 => upper.clone(),
        8 => {
            let (head, tail) = upper.split_at(6);
            if tail == "FF" || tail == "00" {
                head.to_string()
            } else if &upper[..2] == "FF" || &upper[..2] == "00" {
                upper[2..].to_string()
            } else {
                // Conservative fallback: take the last 6.
                upper[2..].to_string()
            }
        }
        _ => return None,
    };
    Some((format!("#{canonical_hex}"), raw_trim.to_string()))
}

/// Classifies a tray's `remain` field per spec §4.4: fraction in [0,1],
/// percentage in (1,100], or grams when it exceeds 100.
pub fn classify_remain(value: f64) -> RemainUnit {
    if (0.0..=1.0).contains(&value) {
        RemainUnit::Fraction
    } else if value > 1.0 && value <= 100.0 {
        RemainUnit::Percent
    } else {
        RemainUnit::Grams
    }
}

fn to_int(v: &Json) -> Option<i32> {
    match v {
        Json::Number(n) => n.as_i64().map(|i| i as i32),
        Json::String(s) => {
            let s = s.trim();
            if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit() || c == '-') {
                s.parse().ok()
            } else {
                None
            }
        }
        _ => None,
    }
}

fn to_f64(v: &Json) -> Option<f64> {
    match v {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_str(v: &Json) -> Option<String> {
    match v {
        Json::String(s) if !s.is_empty() => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 255 is the firmware sentinel for "no active tray" (spec §4.4).
fn normalize_tray_now(v: Option<&Json>) -> Option<i32> {
    let n = v.and_then(to_int)?;
    if n == 255 {
        None
    } else {
        Some(n)
    }
}

fn parse_tray(t: &Json) -> Option<NormalizedTray> {
    let id = to_int(t.get("id")?)?;
    let material = t
        .get("tray_type")
        .or_else(|| t.get("type"))
        .and_then(to_str);
    let color_raw = t.get("tray_color").or_else(|| t.get("color")).and_then(to_str);
    let (color_hex, color_hex_raw) = match color_raw.as_deref().and_then(normalize_color_hex) {
        Some((canon, raw)) => (Some(canon), Some(raw)),
        None => (None, color_raw),
    };
    let remain = t.get("remain").and_then(to_f64);
    let remain_unit = remain.map(classify_remain);

    Some(NormalizedTray {
        id,
        material,
        color_hex,
        color_hex_raw,
        remain,
        remain_unit,
        tag_uid: t.get("tag_uid").and_then(to_str),
        tray_uuid: t.get("tray_uuid").and_then(to_str),
        tray_id_name: t.get("tray_id_name").and_then(to_str),
    })
}

fn collect_trays(ams: &Json) -> Vec<NormalizedTray> {
    let mut out = Vec::new();
    if let Some(Json::Array(direct)) = ams.get("tray") {
        out.extend(direct.iter().filter_map(parse_tray));
    }
    if let Some(Json::Array(units)) = ams.get("ams") {
        for unit in units {
            if let Some(Json::Array(trays)) = unit.get("tray") {
                out.extend(trays.iter().filter_map(parse_tray));
            }
        }
    }
    out
}

fn parse_filament(idx: usize, f: &Json) -> Option<NormalizedFilament> {
    let color_raw = f.get("color_hex").or_else(|| f.get("color")).and_then(to_str);
    let color_hex = color_raw.as_deref().and_then(normalize_color_hex).map(|(c, _)| c);
    Some(NormalizedFilament {
        tray_id: f.get("tray_id").and_then(to_int),
        material: f.get("type").and_then(to_str).or_else(|| {
            f.get("material").and_then(to_str)
        }),
        color_hex,
        used_mm: f.get("used_mm").and_then(to_f64),
        total_mm: f.get("total_mm").and_then(to_f64),
        used_g: f.get("used_g").and_then(to_f64),
        total_g: f.get("total_g").and_then(to_f64),
    })
    .filter(|_| {
        // Keep positional even when sparse; idx is only used upstream for
        // alignment, not stored.
        let _ = idx;
        true
    })
}

/// Converts a raw printer telemetry payload into normalized data, or
/// `None` when the payload carries no `print` sub-object (spec §4.4).
pub fn normalize_payload(payload: &Json) -> Option<NormalizedData> {
    let print = payload.get("print")?.as_object()?;
    let print = Json::Object(print.clone());

    let gcode_state = print.get("gcode_state").and_then(to_str);
    let progress = print
        .get("mc_percent")
        .or_else(|| print.get("progress"))
        .or_else(|| print.get("mc_print_percent"))
        .and_then(to_int);

    let ams = print.get("ams").cloned().unwrap_or(Json::Null);
    let tray_now = normalize_tray_now(ams.get("tray_now"));
    let ams_trays = if ams.is_object() { collect_trays(&ams) } else { Vec::new() };

    let filament = match print.get("filament") {
        Some(Json::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, f)| parse_filament(i, f))
            .collect(),
        _ => Vec::new(),
    };

    let task_id = print
        .get("task_id")
        .or_else(|| print.get("job_id"))
        .or_else(|| print.get("subtask_id"))
        .and_then(to_str);

    Some(NormalizedData {
        gcode_state,
        progress,
        mc_remaining_time: print.get("mc_remaining_time").and_then(to_int).map(i64::from),
        gcode_file: print.get("gcode_file").and_then(to_str),
        gcode_start_time: print.get("gcode_start_time").and_then(to_int).map(i64::from),
        task_id,
        subtask_id: print.get("subtask_id").and_then(to_str),
        subtask_name: print.get("subtask_name").and_then(to_str),
        tray_now,
        ams_trays,
        filament,
    })
}

/// Stable signature over AMS tray state, used for progress-event dedupe
/// (spec §4.5 step 5). Any tray change (including swap while progress is
/// static) breaks the signature.
pub fn ams_signature(data: &NormalizedData) -> String {
    use sha2::{Digest, Sha256};
    let mut trays = data.ams_trays.clone();
    trays.sort_by_key(|t| t.id);
    let blob = serde_json::json!({ "tray_now": data.tray_now, "trays": trays });
    let bytes = serde_json::to_vec(&blob).unwrap_or_default();
    hex::encode(Sha256::digest(bytes))
}

/// Stable signature over filament estimate state (spec §4.5 step 5).
pub fn filament_signature(data: &NormalizedData) -> String {
    use sha2::{Digest, Sha256};
    let blob = serde_json::to_vec(&data.filament).unwrap_or_default();
    hex::encode(Sha256::digest(blob))
}

/// Stable signature over the presence of a cached filament estimate
/// (spec §4.5 step 5): any newly-arrived estimate breaks dedupe.
pub fn estimate_signature(has_estimate: bool, estimate_key: Option<&str>) -> String {
    format!("{has_estimate}:{}", estimate_key.unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_255_means_no_tray() {
        let payload = serde_json::json!({ "print": { "gcode_state": "RUNNING", "ams": { "tray_now": "255" } } });
        let n = normalize_payload(&payload).unwrap();
        assert_eq!(n.tray_now, None);
    }

    #[test]
    fn numeric_string_tray_now_coerces() {
        let payload = serde_json::json!({ "print": { "gcode_state": "RUNNING", "ams": { "tray_now": "2" } } });
        let n = normalize_payload(&payload).unwrap();
        assert_eq!(n.tray_now, Some(2));
    }

    #[test]
    fn flattens_both_ams_layouts() {
        let payload = serde_json::json!({
            "print": {
                "gcode_state": "RUNNING",
                "ams": {
                    "tray_now": "0",
                    "tray": [{"id": "0", "tray_type": "PLA", "tray_color": "FFFFFF"}],
                    "ams": [{"tray": [{"id": "1", "tray_type": "PETG", "tray_color": "000000"}]}]
                }
            }
        });
        let n = normalize_payload(&payload).unwrap();
        assert_eq!(n.ams_trays.len(), 2);
        assert!(n.ams_trays.iter().any(|t| t.id == 0));
        assert!(n.ams_trays.iter().any(|t| t.id == 1));
    }

    #[test]
    fn color_hex_alpha_last() {
        // 8 digits ending in FF: alpha-last, strip last 2.
        let (canon, raw) = normalize_color_hex("AABBCCFF").unwrap();
        assert_eq!(canon, "#AABBCC");
        assert_eq!(raw, "AABBCCFF");
    }

    #[test]
    fn color_hex_alpha_first() {
        // 8 digits starting with FF and not ending in FF/00: alpha-first.
        let (canon, _) = normalize_color_hex("FF112233").unwrap();
        assert_eq!(canon, "#112233");
    }

    #[test]
    fn color_hex_six_digit_passthrough() {
        let (canon, raw) = normalize_color_hex("#ff00aa").unwrap();
        assert_eq!(canon, "#FF00AA");
        assert_eq!(raw, "#ff00aa");
    }

    #[test]
    fn remain_unit_classification() {
        assert_eq!(classify_remain(0.5), RemainUnit::Fraction);
        assert_eq!(classify_remain(1.0), RemainUnit::Fraction);
        assert_eq!(classify_remain(50.0), RemainUnit::Percent);
        assert_eq!(classify_remain(250.0), RemainUnit::Grams);
    }

    #[test]
    fn official_tray_detection() {
        let t = NormalizedTray {
            id: 0,
            material: None,
            color_hex: None,
            color_hex_raw: None,
            remain: None,
            remain_unit: None,
            tag_uid: Some("ABC123".into()),
            tray_uuid: None,
            tray_id_name: None,
        };
        assert!(t.is_official());

        let t2 = NormalizedTray { tag_uid: None, ..t };
        assert!(!t2.is_official());
    }

    #[test]
    fn ams_signature_changes_on_tray_swap() {
        let a = normalize_payload(&serde_json::json!({
            "print": {"gcode_state": "RUNNING", "ams": {"tray_now": "0", "tray": [{"id": 0, "remain": 90}]}}
        }))
        .unwrap();
        let b = normalize_payload(&serde_json::json!({
            "print": {"gcode_state": "RUNNING", "ams": {"tray_now": "0", "tray": [{"id": 0, "remain": 10}]}}
        }))
        .unwrap();
        assert_ne!(ams_signature(&a), ams_signature(&b));
    }
}
