//! The dispatch state machine.
//!
//! Each invocation pulls a bounded batch of pending events, filters to those
//! whose backoff interval has elapsed, and processes them strictly
//! sequentially: the authority's minimum-wait rule is global per issuer, so
//! concurrency would violate it. Every transition is persisted through the
//! store as a single atomic update.
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{error, info, warn};
use uuid::Uuid;
use verifactu_core::client::{AeatClient, AeatError};
use verifactu_core::registro::xml::{suministro_xml, Cabecera};
use verifactu_core::registro::{self, hash};
use verifactu_core::xades::{validate_certificate, XadesSigner};

use crate::config::{DispatchMode, DispatcherConfig};
use crate::error::Result;
use crate::secrets::{decrypt_field, CertificateMaterial};
use crate::store::{DispatchEvent, Store};

/// Outcome of one event within a run.
#[derive(Debug, Clone, Serialize)]
pub struct EventOutcome {
    pub id: Uuid,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// Summary returned by the default dispatch action.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub ok: bool,
    pub polled: usize,
    pub processed: usize,
    pub results: Vec<EventOutcome>,
}

/// Why a pipeline run failed, with the short code persisted to the queue.
#[derive(Debug)]
enum PipelineFailure {
    Validation(String),
    Certificate(String),
    EndpointUnavailable(String),
    Transport(String),
    Parse(String),
    Rejected(serde_json::Value),
}

impl PipelineFailure {
    fn code(&self) -> &'static str {
        match self {
            PipelineFailure::Validation(_) => "validation_error",
            PipelineFailure::Certificate(_) => "certificate_error",
            PipelineFailure::EndpointUnavailable(_) => "endpoint_unavailable",
            PipelineFailure::Transport(_) => "transport_error",
            PipelineFailure::Parse(_) => "parse_error",
            PipelineFailure::Rejected(_) => "aeat_rejected",
        }
    }

    fn response(&self, at: DateTime<Utc>) -> serde_json::Value {
        match self {
            PipelineFailure::Rejected(detail) => detail.clone(),
            PipelineFailure::Validation(reason)
            | PipelineFailure::Certificate(reason)
            | PipelineFailure::EndpointUnavailable(reason)
            | PipelineFailure::Transport(reason)
            | PipelineFailure::Parse(reason) => json!({
                "status": "FAILED",
                "at": at.to_rfc3339(),
                "code": self.code(),
                "reason": reason,
            }),
        }
    }
}

/// Failure transition: one more attempt, terminal once the cap is reached.
/// Attempt counts only ever grow.
pub fn failure_transition(previous_attempts: i32, max_attempts: u32) -> (i32, bool) {
    let attempts = previous_attempts + 1;
    (attempts, attempts >= max_attempts as i32)
}

/// Whether an event's backoff interval has elapsed. Waits are indexed by the
/// attempt count and measured from the last send (or creation for the first
/// attempt).
pub fn is_due(
    attempts: u32,
    sent_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    config: &DispatcherConfig,
) -> bool {
    let last = sent_at.unwrap_or(created_at);
    let wait_minutes = config.backoff_minutes(attempts);
    (now - last).num_seconds() >= (wait_minutes * 60) as i64
}

/// Deterministic simulated outcome: the event id is hashed and the first
/// byte compared against the reject rate, so replaying an event always
/// yields the same answer.
pub fn simulated_outcome(event_id: Uuid, reject_rate: f64) -> (bool, serde_json::Value) {
    let digest = Sha256::digest(event_id.as_bytes());
    let sample = digest[0] as f64 / 256.0;
    let accept = sample >= reject_rate;
    let at = Utc::now().to_rfc3339();
    if accept {
        (
            true,
            json!({ "status": "ACCEPTED", "at": at, "echo": { "id": event_id }, "simulation": true }),
        )
    } else {
        (
            false,
            json!({ "status": "REJECTED", "at": at, "reason": "simulated rejection", "simulation": true }),
        )
    }
}

pub struct Dispatcher {
    store: Store,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(store: Store, config: DispatcherConfig) -> Self {
        Self { store, config }
    }

    /// One polling pass: fetch, filter to due events, process sequentially.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let events = self.store.fetch_pending(self.config.batch_size).await?;
        let polled = events.len();
        let now = Utc::now();
        let due: Vec<DispatchEvent> = events
            .into_iter()
            .filter(|ev| is_due(ev.attempts as u32, ev.sent_at, ev.created_at, now, &self.config))
            .collect();

        info!(polled, due = due.len(), mode = self.config.mode.as_str(), "dispatch pass");

        // Flow-control state is per issuer; clients live for this
        // invocation only.
        let mut clients: HashMap<String, AeatClient> = HashMap::new();
        let mut results = Vec::new();

        for event in due {
            match self.process_event(&event, &mut clients).await {
                Ok(outcome) => results.push(outcome),
                Err(err) => {
                    // Unexpected failure: retryable up to the same cap.
                    error!(event = %event.id, error = %err, "dispatch error");
                    let (attempts, terminal) =
                        failure_transition(event.attempts, self.config.max_attempts);
                    let code = if terminal { "max_attempts" } else { "dispatch_error" };
                    self.store
                        .record_failure(event.id, attempts, terminal, code, None)
                        .await?;
                    results.push(EventOutcome {
                        id: event.id,
                        status: if terminal { "rejected" } else { "retry" }.into(),
                        attempts: Some(attempts),
                        mode: None,
                    });
                }
            }
        }

        Ok(RunSummary {
            ok: true,
            polled,
            processed: results.len(),
            results,
        })
    }

    async fn process_event(
        &self,
        event: &DispatchEvent,
        clients: &mut HashMap<String, AeatClient>,
    ) -> Result<EventOutcome> {
        // Conditional claim: if another invocation got here first, leave the
        // event alone.
        if !self.store.claim(event.id).await? {
            warn!(event = %event.id, "event already claimed, skipping");
            return Ok(EventOutcome {
                id: event.id,
                status: "skipped".into(),
                attempts: None,
                mode: None,
            });
        }

        let result = match self.config.mode {
            DispatchMode::Mock => Ok(simulated_outcome(event.id, self.config.reject_rate)),
            DispatchMode::Live => match self.live_pipeline(event, clients).await? {
                Ok(response) => Ok((true, response)),
                Err(PipelineFailure::EndpointUnavailable(reason)) if self.config.fallback_enabled => {
                    // Explicitly enabled fallback only: simulate acceptance
                    // when the endpoint itself is unreachable.
                    warn!(event = %event.id, reason = %reason, "endpoint unavailable, falling back to simulation");
                    Ok(simulated_outcome(event.id, self.config.reject_rate))
                }
                Err(failure) => Err(failure),
            },
        };

        match result {
            Ok((true, response)) => {
                let simulated = response
                    .get("simulation")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                self.store.mark_accepted(event.id, &response).await?;
                let meta_status = if event.event_type == "anulacion" {
                    "void"
                } else {
                    "accepted"
                };
                self.store.set_meta_status(event.invoice_id, meta_status).await?;
                Ok(EventOutcome {
                    id: event.id,
                    status: "accepted".into(),
                    attempts: None,
                    mode: Some(if simulated { "simulation" } else { "live" }.into()),
                })
            }
            Ok((false, response)) => {
                self.fail(event, "simulated_rejection", Some(response)).await
            }
            Err(failure) => {
                let response = failure.response(Utc::now());
                self.fail(event, failure.code(), Some(response)).await
            }
        }
    }

    async fn fail(
        &self,
        event: &DispatchEvent,
        code: &str,
        response: Option<serde_json::Value>,
    ) -> Result<EventOutcome> {
        let (attempts, terminal) = failure_transition(event.attempts, self.config.max_attempts);
        let last_error = if terminal { "max_attempts" } else { code };
        self.store
            .record_failure(event.id, attempts, terminal, last_error, response.as_ref())
            .await?;
        self.store.set_meta_status(event.invoice_id, "rejected").await?;
        Ok(EventOutcome {
            id: event.id,
            status: if terminal { "rejected" } else { "retry" }.into(),
            attempts: Some(attempts),
            mode: None,
        })
    }

    /// Full transform -> render -> sign -> submit pipeline for one event.
    ///
    /// The outer `Result` carries store errors; the inner one the pipeline
    /// failure classification.
    async fn live_pipeline(
        &self,
        event: &DispatchEvent,
        clients: &mut HashMap<String, AeatClient>,
    ) -> Result<std::result::Result<serde_json::Value, PipelineFailure>> {
        let Some(loaded) = self.store.invoice_record(event.invoice_id).await? else {
            return Ok(Err(PipelineFailure::Validation("invoice not found".into())));
        };

        let Some(settings_row) = self.store.issuer_settings(loaded.company_id).await? else {
            return Ok(Err(PipelineFailure::Validation(
                "issuer has no VeriFactu settings".into(),
            )));
        };
        let settings = settings_row.issuer_settings()?;

        let Some(enc_key) = self.config.cert_enc_key.as_deref() else {
            return Ok(Err(PipelineFailure::Certificate(
                "certificate encryption key is not configured".into(),
            )));
        };
        let material = match (&settings_row.cert_pem_enc, &settings_row.key_pem_enc) {
            (Some(cert_enc), Some(key_enc)) => {
                let decrypt = |payload: &str| decrypt_field(payload, enc_key);
                match (
                    decrypt(cert_enc),
                    decrypt(key_enc),
                    settings_row
                        .key_pass_enc
                        .as_deref()
                        .map(decrypt)
                        .transpose(),
                ) {
                    (Ok(cert_pem), Ok(key_pem), Ok(key_password)) => CertificateMaterial {
                        cert_pem,
                        key_pem,
                        key_password,
                    },
                    _ => {
                        return Ok(Err(PipelineFailure::Certificate(
                            "stored certificate material could not be decrypted".into(),
                        )))
                    }
                }
            }
            _ => {
                return Ok(Err(PipelineFailure::Certificate(
                    "issuer has no stored certificate".into(),
                )))
            }
        };

        if let Err(err) = validate_certificate(&material.cert_pem) {
            return Ok(Err(PipelineFailure::Certificate(err.to_string())));
        }

        let anchor = self
            .store
            .chain_anchor(&settings.issuer_nif, event.invoice_id)
            .await?;

        let generated_at = hash::generation_timestamp();
        let transformed = if event.event_type == "anulacion" {
            registro::to_anulacion(&loaded.record, &settings, anchor.as_ref(), &generated_at)
        } else {
            registro::to_alta(&loaded.record, &settings, anchor.as_ref(), &generated_at)
        };
        let registro = match transformed {
            Ok(registro) => registro,
            Err(err) => {
                let issues = format!("{:?}", err.issues);
                return Ok(Err(PipelineFailure::Validation(issues)));
            }
        };

        let cabecera = Cabecera::for_issuer(&settings, false);
        let xml = suministro_xml(&cabecera, std::slice::from_ref(&registro));

        let signer = match XadesSigner::from_pem(
            &material.cert_pem,
            &material.key_pem,
            material.key_password.as_deref(),
        ) {
            Ok(signer) => signer,
            Err(err) => return Ok(Err(PipelineFailure::Certificate(err.to_string()))),
        };
        let signed_xml = match signer.sign_enveloped(&xml) {
            Ok(signed) => signed,
            Err(err) => return Ok(Err(PipelineFailure::Certificate(err.to_string()))),
        };

        let client = match clients.entry(settings.issuer_nif.clone()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(slot) => {
                match AeatClient::with_certificate(
                    settings.environment,
                    &material.cert_pem,
                    &material.key_pem,
                ) {
                    Ok(client) => slot.insert(client),
                    Err(err) => {
                        return Ok(Err(PipelineFailure::Certificate(err.to_string())))
                    }
                }
            }
        };

        let response = match client.submit(registro.operation(), &signed_xml).await {
            Ok(response) => response,
            Err(AeatError::EndpointUnavailable(reason)) => {
                return Ok(Err(PipelineFailure::EndpointUnavailable(reason)))
            }
            Err(AeatError::Transport(err)) => {
                return Ok(Err(PipelineFailure::Transport(err.to_string())))
            }
            Err(AeatError::Parse(reason)) => {
                return Ok(Err(PipelineFailure::Parse(reason)))
            }
        };

        if response.accepted {
            let invoice_id = registro.invoice_id().clone();
            let meta_status = if event.event_type == "anulacion" {
                "void"
            } else {
                "accepted"
            };
            self.store
                .record_acceptance_meta(
                    event.invoice_id,
                    &invoice_id.issuer_nif,
                    &invoice_id.serial,
                    &invoice_id.issue_date,
                    registro.huella(),
                    meta_status,
                    &json!({
                        "csv": response.csv,
                        "accepted_count": response.accepted_count,
                        "wait_seconds": response.wait_seconds,
                    }),
                )
                .await?;
            Ok(Ok(json!({
                "status": "ACCEPTED",
                "at": Utc::now().to_rfc3339(),
                "csv": response.csv,
                "wait_seconds": response.wait_seconds,
                "accepted_count": response.accepted_count,
                "rejected_count": response.rejected_count,
            })))
        } else {
            Ok(Err(PipelineFailure::Rejected(json!({
                "status": "REJECTED",
                "at": Utc::now().to_rfc3339(),
                "errors": response.errors,
                "rejected_count": response.rejected_count,
            }))))
        }
    }
}
