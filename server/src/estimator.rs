//! Estimator Client (spec §4.3). Fetches a slicer's per-filament gram
//! estimate for a job by listing the printer's file store over its
//! file-transfer channel, downloading the best-matching `*.gcode.3mf`
//! archive, and scanning the embedded plate G-code's header comments.
//! Grounded in
//! `original_source/collector/collector/gcode_estimator.py`: the
//! matching heuristic, the header-comment parser, and the
//! schedule-once-per-key cache are carried over faithfully; the
//! subprocess `curl` calls become a blocking `std::process::Command`
//! shelled out from a `spawn_blocking` task so the async ingest path
//! never stalls on file transfer (spec §5 "the estimator is explicitly
//! background-scheduled so it never blocks the ingest path").

use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilamentEstimate {
    pub idx: i32,
    pub tray_id: Option<i32>,
    #[serde(rename = "type")]
    pub material_type: Option<String>,
    pub color_hex: Option<String>,
    pub total_g: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Estimate {
    pub source: &'static str,
    pub confidence: Confidence,
    pub gcode_3mf_name: Option<String>,
    pub member_gcode_path: Option<String>,
    pub total_g: Option<f64>,
    pub per_filament: Vec<FilamentEstimate>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Estimate {
    fn failed(error: impl Into<String>) -> Self {
        Estimate {
            source: "gcode_3mf",
            confidence: Confidence::Low,
            gcode_3mf_name: None,
            member_gcode_path: None,
            total_g: None,
            per_filament: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Job-identity cache + in-flight task map, one per running process
/// (spec §4.3/§5: "at most one background task per key").
pub struct GcodeEstimator {
    ttl: Duration,
    cache: Mutex<HashMap<String, (Instant, Arc<Estimate>)>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Default for GcodeEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl GcodeEstimator {
    pub fn new(ttl: Duration) -> Self {
        GcodeEstimator {
            ttl,
            cache: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_cached(&self, key: &str) -> Option<Arc<Estimate>> {
        let cache = self.cache.lock().await;
        let (expires_at, est) = cache.get(key)?;
        if *expires_at <= Instant::now() {
            return None;
        }
        Some(est.clone())
    }

    /// Schedules a background estimate fetch for `key` unless one is
    /// already cached or in flight. Never awaits the fetch itself.
    pub async fn maybe_schedule(
        self: &Arc<Self>,
        key: String,
        printer_ip: String,
        access_code: String,
        subtask_name: Option<String>,
        gcode_file: Option<String>,
    ) {
        let mut tasks = self.tasks.lock().await;
        if self.get_cached(&key).await.is_some() {
            return;
        }
        if tasks.get(&key).is_some_and(|h| !h.is_finished()) {
            return;
        }

        let this = self.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let est = tokio::task::spawn_blocking(move || {
                compute_estimate(&printer_ip, "bblp", &access_code, subtask_name.as_deref(), gcode_file.as_deref())
            })
            .await
            .unwrap_or_else(|e| Estimate::failed(format!("join_error:{e}")));

            let mut cache = this.cache.lock().await;
            cache.insert(task_key, (Instant::now() + this.ttl, Arc::new(est)));
        });
        tasks.insert(key, handle);
    }
}

fn normalize_name_for_match(s: &str) -> String {
    s.trim()
        .chars()
        .filter(|&c| c.is_ascii_digit() || c.is_ascii_alphabetic() || ('\u{4e00}'..='\u{9fff}').contains(&c))
        .collect()
}

fn best_match_gcode3mf(candidates: &[String], subtask_name: Option<&str>) -> Result<String, &'static str> {
    if candidates.is_empty() {
        return Err("no_candidates");
    }
    let subtask_name = subtask_name.map(str::trim).filter(|s| !s.is_empty()).ok_or("missing_subtask_name")?;

    let key = normalize_name_for_match(subtask_name);
    if key.is_empty() {
        return Err("empty_subtask_name");
    }

    let direct = format!("{subtask_name}.gcode.3mf");
    if candidates.iter().any(|c| c == &direct) {
        return Ok(direct);
    }

    let mut scored: Vec<(usize, &String)> = Vec::new();
    for fn_ in candidates {
        let base = fn_.strip_suffix(".gcode.3mf").unwrap_or(fn_);
        let n = normalize_name_for_match(base);
        if n.is_empty() {
            continue;
        }
        if n.contains(&key) || key.contains(&n) {
            scored.push((key.len().min(n.len()), fn_));
            continue;
        }
        let key_chars: Vec<char> = key.chars().collect();
        let mut best = 0usize;
        for i in 0..key_chars.len() {
            for j in (i + 1)..=(key_chars.len().min(i + 32)) {
                let sub: String = key_chars[i..j].iter().collect();
                if n.contains(&sub) {
                    best = best.max(j - i);
                }
            }
        }
        if best > 0 {
            scored.push((best, fn_));
        }
    }

    if scored.is_empty() {
        return Err("no_match");
    }
    let top_score = scored.iter().map(|(s, _)| *s).max().unwrap();
    let top: Vec<&String> = scored.iter().filter(|(s, _)| *s == top_score).map(|(_, f)| *f).collect();
    if top.len() != 1 {
        return Err("ambiguous_match");
    }
    Ok(top[0].clone())
}

fn curl_list_root(ip: &str, username: &str, password: &str) -> Result<Vec<String>, String> {
    let url = format!("ftps://{ip}/");
    let out = Command::new("curl")
        .args(["-sS", "-k", "--list-only", "--user", &format!("{username}:{password}"), &url])
        .output()
        .map_err(|e| e.to_string())?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(if stderr.trim().is_empty() {
            format!("curl list failed rc={:?}", out.status.code())
        } else {
            stderr.trim().to_string()
        });
    }
    let stdout = String::from_utf8_lossy(&out.stdout);
    Ok(stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && *l != "." && *l != "..")
        .map(str::to_string)
        .collect())
}

fn curl_download(ip: &str, username: &str, password: &str, remote_name: &str, out_path: &std::path::Path) -> Result<(), String> {
    let url = format!("ftps://{ip}/{remote_name}");
    let out = Command::new("curl")
        .args(["-sS", "-k", "--user", &format!("{username}:{password}"), &url, "-o"])
        .arg(out_path)
        .output()
        .map_err(|e| e.to_string())?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(if stderr.trim().is_empty() {
            format!("curl download failed rc={:?}", out.status.code())
        } else {
            stderr.trim().to_string()
        });
    }
    Ok(())
}

fn parse_gcode_comments(text: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in text.lines() {
        let Some(rest) = line.strip_prefix(';') else { continue };
        let rest = rest.trim();
        if rest.is_empty() {
            continue;
        }
        let (k, v) = if let Some(idx) = rest.find(':') {
            (&rest[..idx], &rest[idx + 1..])
        } else if let Some(idx) = rest.find('=') {
            (&rest[..idx], &rest[idx + 1..])
        } else {
            continue;
        };
        let k = k.trim().to_lowercase();
        let v = v.trim().to_string();
        if k.is_empty() || v.is_empty() {
            continue;
        }
        out.entry(k).or_insert(v);
    }
    out
}

fn split_csv_values(s: &str) -> Vec<String> {
    s.replace(';', ",")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn normalize_color_token(raw: &str) -> Option<String> {
    let c0 = raw.trim();
    if c0.is_empty() {
        return None;
    }
    let stripped = c0.strip_prefix('#').unwrap_or(c0);
    let hx = stripped.trim().to_uppercase();
    if hx.len() == 8 && hx.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(format!("#{}", &hx[2..]))
    } else if hx.len() == 6 && hx.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(format!("#{hx}"))
    } else {
        None
    }
}

fn extract_per_filament(meta: &HashMap<String, String>) -> Vec<FilamentEstimate> {
    const COLOR_KEYS: [&str; 4] = ["filament_color", "filament_colour", "filament_colors", "filament_colours"];
    const TYPE_KEYS: [&str; 4] = ["filament_type", "filament_types", "filament material", "filament_material"];
    const WEIGHT_KEYS: [&str; 6] = [
        "filament_weight [g]",
        "filament weight [g]",
        "filament_weight[g]",
        "filament used [g]",
        "filament_used [g]",
        "filament_used[g]",
    ];

    let colors = COLOR_KEYS.iter().find_map(|k| meta.get(*k)).map(|v| split_csv_values(v)).unwrap_or_default();
    let types = TYPE_KEYS.iter().find_map(|k| meta.get(*k)).map(|v| split_csv_values(v)).unwrap_or_default();
    let weights = WEIGHT_KEYS.iter().find_map(|k| meta.get(*k)).map(|v| split_csv_values(v)).unwrap_or_default();

    if weights.is_empty() {
        return Vec::new();
    }

    weights
        .iter()
        .enumerate()
        .filter_map(|(i, w)| {
            let wg: f64 = w.parse().ok()?;
            if !wg.is_finite() || wg <= 0.0 {
                return None;
            }
            Some(FilamentEstimate {
                idx: i as i32,
                tray_id: None,
                material_type: types.get(i).map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
                color_hex: colors.get(i).and_then(|c| normalize_color_token(c)),
                total_g: wg,
            })
        })
        .collect()
}

fn extract_single_filament_from_meta(meta: &HashMap<String, String>, total_g: Option<f64>) -> Vec<FilamentEstimate> {
    let Some(total_g) = total_g.filter(|g| g.is_finite() && *g > 0.0) else {
        return Vec::new();
    };

    let color_raw = meta.get("filament_colour").or_else(|| meta.get("filament_color"));
    let type_raw = meta.get("filament_type");

    let colors = color_raw.map(|v| split_csv_values(v)).unwrap_or_default();
    let types = type_raw.map(|v| split_csv_values(v)).unwrap_or_default();

    if colors.len() > 1 || types.len() > 1 {
        return Vec::new();
    }

    vec![FilamentEstimate {
        idx: 0,
        tray_id: None,
        material_type: types.first().map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
        color_hex: colors.first().and_then(|c| normalize_color_token(c)),
        total_g,
    }]
}

fn total_g_regex() -> Regex {
    Regex::new(r"(?i)^\s*;\s*total\s+filament\s+weight\s*\[g\]\s*:\s*([0-9]+(?:\.[0-9]+)?)\s*$").unwrap()
}

fn parse_gcode_from_3mf(
    path: &std::path::Path,
    member_hint: Option<&str>,
) -> Result<(Option<f64>, Vec<FilamentEstimate>, Option<String>, Option<String>), String> {
    let file = std::fs::File::open(path).map_err(|e| e.to_string())?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| e.to_string())?;

    let names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|f| f.name().to_string()))
        .collect();

    let member = member_hint
        .map(|h| h.trim_start_matches('/'))
        .and_then(|hint| {
            if names.iter().any(|n| n == hint) {
                Some(hint.to_string())
            } else if let Some(stripped) = hint.strip_prefix("data/") {
                names.iter().find(|n| n.as_str() == stripped).cloned()
            } else {
                None
            }
        })
        .or_else(|| names.iter().find(|n| n.starts_with("Metadata/") && n.ends_with(".gcode") && n.contains("plate_")).cloned());

    let Some(member) = member else {
        return Ok((None, Vec::new(), None, Some("missing_gcode_member".to_string())));
    };

    let mut entry = archive.by_name(&member).map_err(|e| e.to_string())?;
    let mut raw = Vec::new();
    std::io::Read::read_to_end(&mut entry, &mut raw).map_err(|e| e.to_string())?;
    let head_len = raw.len().min(512_000);
    let text = String::from_utf8_lossy(&raw[..head_len]).into_owned();

    let re = total_g_regex();
    let mut total_g = None;
    for line in text.lines().take(5000) {
        if let Some(caps) = re.captures(line) {
            total_g = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok());
            break;
        }
    }

    let meta = parse_gcode_comments(&text);
    let mut per = extract_per_filament(&meta);
    if per.is_empty() {
        per = extract_single_filament_from_meta(&meta, total_g);
    }

    Ok((total_g, per, Some(member), None))
}

fn compute_estimate(printer_ip: &str, username: &str, access_code: &str, subtask_name: Option<&str>, gcode_file: Option<&str>) -> Estimate {
    let root = match curl_list_root(printer_ip, username, access_code) {
        Ok(r) => r,
        Err(e) => return Estimate::failed(format!("list_root_failed:{e}")),
    };

    let candidates: Vec<String> = root.into_iter().filter(|n| n.ends_with(".gcode.3mf")).collect();
    let name = match best_match_gcode3mf(&candidates, subtask_name) {
        Ok(n) => n,
        Err(why) => return Estimate::failed(format!("select_failed:{why}")),
    };

    let member_hint = gcode_file.map(str::trim).filter(|s| !s.is_empty()).map(|h| {
        h.strip_prefix("/data/").unwrap_or(h).trim_start_matches('/').to_string()
    });

    let Ok(dir) = tempfile::Builder::new().prefix("gcode_est_").tempdir() else {
        return Estimate::failed("tempdir_failed");
    };
    let local = dir.path().join(&name);
    if let Err(e) = curl_download(printer_ip, username, access_code, &name, &local) {
        return Estimate {
            source: "gcode_3mf",
            confidence: Confidence::Low,
            gcode_3mf_name: Some(name),
            member_gcode_path: None,
            total_g: None,
            per_filament: Vec::new(),
            error: Some(format!("download_failed:{e}")),
        };
    }

    match parse_gcode_from_3mf(&local, member_hint.as_deref()) {
        Ok((total_g, per, member_used, err)) => {
            let confidence = if total_g.is_some() && !per.is_empty() {
                Confidence::High
            } else if total_g.is_some() {
                Confidence::Medium
            } else {
                Confidence::Low
            };
            Estimate {
                source: "gcode_3mf",
                confidence,
                gcode_3mf_name: Some(name),
                member_gcode_path: member_used,
                total_g,
                per_filament: per,
                error: err,
            }
        }
        Err(e) => {
            warn!(error = %e, archive = %name, "failed to parse gcode 3mf archive");
            Estimate {
                source: "gcode_3mf",
                confidence: Confidence::Low,
                gcode_3mf_name: Some(name),
                member_gcode_path: None,
                total_g: None,
                per_filament: Vec::new(),
                error: Some(e),
            }
        }
    }
}
