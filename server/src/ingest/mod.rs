//! Ingestor (spec §4.5): one long-lived MQTT subscriber per printer,
//! handing frames off to a single bounded channel, drained by one
//! consumer loop that writes the raw/normalized event pair per frame.
//! Grounded in the teacher's device channel pattern
//! (`websocket/device.rs`'s `mpsc::channel` + `tokio::spawn` per
//! connection) generalized from one device socket to N printer
//! subscribers feeding a shared queue, and in `main.rs`'s top-level
//! wiring style for how the consumer loop is started.

pub mod dedup;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::crypto;
use crate::db::models::{NormalizedEventType, Printer};
use crate::db::repo::{NormalizedEventRepo, PrinterRepo, RawEventRepo};
use crate::error::Result;
use crate::estimator::GcodeEstimator;
use crate::normalize::{self, NormalizedData};
use crate::settlement;

use dedup::DedupeCache;

/// Shared bounded-queue capacity (spec §5: "capacity ≈ 2000").
const CHANNEL_CAPACITY: usize = 2000;

pub trait IngestRepos: PrinterRepo + RawEventRepo + NormalizedEventRepo + Clone + Send + Sync + 'static {}
impl<T> IngestRepos for T where T: PrinterRepo + RawEventRepo + NormalizedEventRepo + Clone + Send + Sync + 'static {}

struct InboundFrame {
    printer_id: Uuid,
    topic: String,
    payload_bytes: Vec<u8>,
    received_at: DateTime<Utc>,
}

pub struct Ingestor<R: IngestRepos> {
    repos: R,
    app_secret_key: String,
    allow_insecure_mqtt_tls: bool,
}

impl<R: IngestRepos> Ingestor<R> {
    pub fn new(repos: R, app_secret_key: String, allow_insecure_mqtt_tls: bool) -> Self {
        Self {
            repos,
            app_secret_key,
            allow_insecure_mqtt_tls,
        }
    }

    /// Spawns one subscriber task per known printer, then runs the
    /// consumer loop on the current task until the channel closes (every
    /// subscriber has exited, which in practice only happens at process
    /// shutdown since each subscriber reconnects forever).
    pub async fn run(self, estimator: Arc<GcodeEstimator>) -> Result<()> {
        let printers = self.repos.list().await?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        for printer in printers {
            let tx = tx.clone();
            let secret = self.app_secret_key.clone();
            let allow_insecure_mqtt_tls = self.allow_insecure_mqtt_tls;
            tokio::spawn(async move {
                run_printer_subscriber(printer, secret, allow_insecure_mqtt_tls, tx).await;
            });
        }
        drop(tx);

        consume(self.repos, rx, estimator, self.app_secret_key.clone()).await
    }
}

/// Derives the normalized event type from the `gcode_state` transition
/// (spec §4.5 step 4). Order matters: a transition into `RUNNING` always
/// wins, then the running→terminal pairs, then any jump straight to a
/// failure state, then same-state progress, then anything else.
fn derive_event_type(prev_gcode_state: Option<&str>, new_gcode_state: Option<&str>) -> NormalizedEventType {
    use NormalizedEventType::*;

    if new_gcode_state == Some("RUNNING") && prev_gcode_state != Some("RUNNING") {
        return PrintStarted;
    }
    if prev_gcode_state == Some("RUNNING") && matches!(new_gcode_state, Some("FINISH") | Some("IDLE")) {
        return PrintEnded;
    }
    if matches!(new_gcode_state, Some("FAILED") | Some("STOPPED") | Some("CANCELED")) {
        return PrintFailed;
    }
    if prev_gcode_state == new_gcode_state {
        return PrintProgress;
    }
    StateChanged
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `event_id = SHA256(printer_id ∥ payload_hash)` (spec §4.5 step 3).
fn derive_event_id(printer_id: Uuid, payload_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(printer_id.as_bytes());
    hasher.update(payload_hash.as_bytes());
    hex::encode(hasher.finalize())
}

fn parse_payload_or_fallback(bytes: &[u8]) -> Json {
    serde_json::from_slice(bytes).unwrap_or_else(|_| Json::String(String::from_utf8_lossy(bytes).into_owned()))
}

async fn consume<R: IngestRepos>(repos: R, mut rx: mpsc::Receiver<InboundFrame>, estimator: Arc<GcodeEstimator>, app_secret_key: String) -> Result<()> {
    let mut last_gcode_state: HashMap<Uuid, Option<String>> = HashMap::new();
    let mut dedupe = DedupeCache::new();

    while let Some(frame) = rx.recv().await {
        let printer_id = frame.printer_id;
        if let Err(e) = process_frame(&repos, &estimator, &app_secret_key, &mut last_gcode_state, &mut dedupe, frame).await {
            tracing::error!(printer_id = %printer_id, error = %e, "ingest: error processing frame, continuing");
        }
    }
    Ok(())
}

async fn process_frame<R: IngestRepos>(
    repos: &R,
    estimator: &Arc<GcodeEstimator>,
    app_secret_key: &str,
    last_gcode_state: &mut HashMap<Uuid, Option<String>>,
    dedupe: &mut DedupeCache,
    frame: InboundFrame,
) -> Result<()> {
    let content_hash = sha256_hex(&frame.payload_bytes);
    let payload_json = parse_payload_or_fallback(&frame.payload_bytes);

    let raw = repos
        .append(frame.printer_id, &frame.topic, payload_json.clone(), &content_hash, frame.received_at)
        .await?;
    repos.mark_seen(frame.printer_id, frame.received_at).await?;

    let Some(data) = normalize::normalize_payload(&payload_json) else {
        return Ok(());
    };

    let prev_state = last_gcode_state.get(&frame.printer_id).cloned().flatten();
    let event_type = derive_event_type(prev_state.as_deref(), data.gcode_state.as_deref());
    last_gcode_state.insert(frame.printer_id, data.gcode_state.clone());

    let job_key = settlement::derive_job_key(frame.printer_id, &data, frame.received_at);
    let cached = estimator.get_cached(&job_key).await;
    let is_progress = event_type == NormalizedEventType::PrintProgress;
    let duplicate = dedupe.is_duplicate_progress(frame.printer_id, is_progress, &data, cached.is_some(), Some(job_key.as_str()));

    if !duplicate {
        let event_id = derive_event_id(frame.printer_id, &content_hash);
        let payload_doc = serde_json::to_value(&data).unwrap_or(Json::Null);
        repos
            .insert_if_absent(&event_id, frame.printer_id, event_type, frame.received_at, payload_doc, raw.id)
            .await?;
    }

    maybe_schedule_estimate(repos, estimator, app_secret_key, frame.printer_id, &data, job_key, cached.is_some()).await;

    Ok(())
}

/// Spec §4.5 step 7: opportunistically kick off a background estimate
/// while the printer is mid-preparation or mid-print and nothing is
/// cached for this job yet.
async fn maybe_schedule_estimate<R: IngestRepos>(
    repos: &R,
    estimator: &Arc<GcodeEstimator>,
    app_secret_key: &str,
    printer_id: Uuid,
    data: &NormalizedData,
    job_key: String,
    already_cached: bool,
) {
    if already_cached {
        return;
    }
    if !matches!(data.gcode_state.as_deref(), Some("PREPARE") | Some("RUNNING")) {
        return;
    }
    let Ok(Some(printer)) = repos.find_by_id(printer_id).await else {
        return;
    };
    let Ok(access_code) = crypto::decrypt_str(app_secret_key, &printer.lan_access_code_enc) else {
        tracing::warn!(printer_id = %printer_id, "cannot decrypt LAN access code for estimate scheduling");
        return;
    };
    estimator
        .maybe_schedule(job_key, printer.ip.clone(), access_code, data.subtask_name.clone(), data.gcode_file.clone())
        .await;
}

async fn run_printer_subscriber(printer: Printer, app_secret_key: String, allow_insecure_mqtt_tls: bool, tx: mpsc::Sender<InboundFrame>) {
    let topic = format!("device/{}/report", printer.serial);

    loop {
        let access_code = match crypto::decrypt_str(&app_secret_key, &printer.lan_access_code_enc) {
            Ok(code) => code,
            Err(e) => {
                tracing::error!(printer = %printer.serial, error = %e, "cannot decrypt LAN access code, will retry");
                tokio::time::sleep(StdDuration::from_secs(10)).await;
                continue;
            }
        };

        let mut opts = MqttOptions::new(format!("printfarm-ledger-{}", printer.id), printer.ip.clone(), 8883);
        opts.set_credentials("bblp", access_code);
        opts.set_keep_alive(StdDuration::from_secs(30));
        opts.set_transport(tls_transport(allow_insecure_mqtt_tls));

        let (client, mut eventloop) = AsyncClient::new(opts, 64);
        if let Err(e) = client.subscribe(&topic, QoS::AtMostOnce).await {
            tracing::warn!(printer = %printer.serial, error = %e, "mqtt subscribe failed, retrying");
            tokio::time::sleep(StdDuration::from_secs(3)).await;
            continue;
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let frame = InboundFrame {
                        printer_id: printer.id,
                        topic: publish.topic.clone(),
                        payload_bytes: publish.payload.to_vec(),
                        received_at: Utc::now(),
                    };
                    if tx.try_send(frame).is_err() {
                        tracing::warn!(printer = %printer.serial, "ingest channel full, dropping frame");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(printer = %printer.serial, error = %e, "mqtt connection lost, reconnecting");
                    tokio::time::sleep(StdDuration::from_secs(3)).await;
                    break;
                }
            }
        }
    }
}

fn tls_transport(allow_insecure: bool) -> Transport {
    ensure_crypto_provider();
    if allow_insecure {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth();
        Transport::Tls(rumqttc::TlsConfiguration::Rustls(Arc::new(config)))
    } else {
        // No CA bundle management in scope (spec non-goal: secret encryption
        // / TLS infra is an external-collaborator contract); strict mode
        // therefore requires the printer to present a certificate this
        // empty root store would recognize, which no self-signed printer
        // firmware does. Operators who need verified TLS must supply their
        // own transport configuration downstream.
        let roots = rustls::RootCertStore::empty();
        let config = rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
        Transport::Tls(rumqttc::TlsConfiguration::Rustls(Arc::new(config)))
    }
}

fn ensure_crypto_provider() {
    // rustls 0.22's `ClientConfig::builder()` always selects the `ring`
    // provider internally, so there is no process-wide default to install
    // (unlike 0.23's `CryptoProvider::install_default`). Nothing to do.
}

/// Accepts any server certificate. Installed only when
/// `ALLOW_INSECURE_MQTT_TLS` is set (default true), matching printer
/// firmware that serves a self-signed certificate on its LAN MQTT port.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            ED25519,
        ]
    }
}
