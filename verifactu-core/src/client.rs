//! AEAT web-service client: SOAP framing, mutual TLS, flow control and
//! response interpretation.
//!
//! Endpoints and the mandated minimum wait between submissions come from
//! Artículo 16 of Orden HAC/1177/2024. The wait is a hard flow-control rule:
//! the client blocks before sending whenever the authority's last reported
//! wait time has not yet elapsed.
use crate::config::{Environment, Operation};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Initial minimum wait between submissions, in seconds (Art. 16.2).
pub const INITIAL_WAIT_SECS: u64 = 60;

/// Transport-level retry policy: bounded attempts with a fixed delay,
/// independent of the dispatcher's own retry counter.
const TRANSPORT_MAX_ATTEMPTS: u32 = 3;
const TRANSPORT_RETRY_DELAY: Duration = Duration::from_secs(5);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors raised below the protocol layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid client identity: {0}")]
    Identity(String),
}

/// Errors raised by the AEAT client.
#[derive(Debug, Error)]
pub enum AeatError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("could not parse AEAT response: {0}")]
    Parse(String),
    /// The endpoint answered with something that is not the protocol at all
    /// (typically an HTML error or access-denied page).
    #[error("AEAT endpoint unavailable: {0}")]
    EndpointUnavailable(String),
}

/// Line-level error reported by the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AeatRecordError {
    pub code: String,
    pub description: String,
}

/// Parsed submission response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AeatResponse {
    pub accepted: bool,
    /// Código Seguro de Verificación.
    pub csv: Option<String>,
    /// Seconds to wait before the next submission, when reported.
    pub wait_seconds: Option<u64>,
    pub accepted_count: Option<u32>,
    pub rejected_count: Option<u32>,
    pub errors: Vec<AeatRecordError>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub raw: String,
}

/// Transport seam: anything that can POST an XML payload with a SOAPAction
/// header and return the response body. Lets the client be exercised
/// without real mTLS endpoints.
#[async_trait]
pub trait SecureTransport: Send + Sync {
    async fn post_xml(
        &self,
        url: &str,
        soap_action: &str,
        body: &str,
    ) -> Result<String, TransportError>;
}

/// reqwest-backed transport presenting the submitter's client certificate.
#[derive(Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport with the given client certificate and key (PEM),
    /// used for mutual TLS.
    ///
    /// # Errors
    /// Returns [`TransportError::Identity`] when the PEM material cannot be
    /// loaded, [`TransportError::Http`] when the client cannot be built.
    pub fn with_identity(cert_pem: &str, key_pem: &str) -> Result<Self, TransportError> {
        let bundle = format!("{key_pem}\n{cert_pem}");
        let identity = reqwest::Identity::from_pem(bundle.as_bytes())
            .map_err(|e| TransportError::Identity(e.to_string()))?;
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SecureTransport for ReqwestTransport {
    async fn post_xml(
        &self,
        url: &str,
        soap_action: &str,
        body: &str,
    ) -> Result<String, TransportError> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "text/xml; charset=UTF-8")
            .header("SOAPAction", soap_action)
            .body(body.to_string())
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(TransportError::Network(format!(
                "HTTP {status}: {}",
                text.chars().take(200).collect::<String>()
            )));
        }
        Ok(text)
    }
}

/// Wrap a signed registro document in the SOAP 1.1 envelope.
pub fn soap_envelope(body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <soapenv:Envelope xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\">\n  \
         <soapenv:Header/>\n  <soapenv:Body>\n    {body}\n  </soapenv:Body>\n\
         </soapenv:Envelope>"
    )
}

/// AEAT submission client.
///
/// Owns the flow-control state for one issuer: the moment of the last
/// request and the current minimum wait. Instances must not be shared
/// across issuers.
pub struct AeatClient {
    env: Environment,
    transport: Box<dyn SecureTransport>,
    last_request: Option<Instant>,
    wait_secs: u64,
}

impl AeatClient {
    pub fn new(env: Environment, transport: Box<dyn SecureTransport>) -> Self {
        Self {
            env,
            transport,
            last_request: None,
            wait_secs: INITIAL_WAIT_SECS,
        }
    }

    /// Convenience constructor building an mTLS transport from certificate
    /// material.
    pub fn with_certificate(
        env: Environment,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<Self, TransportError> {
        Ok(Self::new(
            env,
            Box::new(ReqwestTransport::with_identity(cert_pem, key_pem)?),
        ))
    }

    pub fn env(&self) -> Environment {
        self.env
    }

    /// Current minimum wait between submissions, in seconds.
    pub fn wait_secs(&self) -> u64 {
        self.wait_secs
    }

    /// Whether a submission may go out immediately.
    pub fn can_send_now(&self) -> bool {
        match self.last_request {
            None => true,
            Some(last) => last.elapsed() >= Duration::from_secs(self.wait_secs),
        }
    }

    /// Remaining wait before the next submission is allowed.
    pub fn time_to_next_send(&self) -> Duration {
        match self.last_request {
            None => Duration::ZERO,
            Some(last) => Duration::from_secs(self.wait_secs).saturating_sub(last.elapsed()),
        }
    }

    /// Submit a signed document for the given operation and interpret the
    /// authority's answer. Enforces the flow-control wait before sending and
    /// retries transport-level failures a bounded number of times.
    ///
    /// # Errors
    /// [`AeatError::Transport`] once transport retries are exhausted,
    /// [`AeatError::EndpointUnavailable`] for non-protocol responses,
    /// [`AeatError::Parse`] for unintelligible protocol responses.
    pub async fn submit(
        &mut self,
        operation: Operation,
        signed_xml: &str,
    ) -> Result<AeatResponse, AeatError> {
        let url = self.env.endpoint_url(operation);
        let soap_action = operation.soap_action();
        let envelope = soap_envelope(signed_xml);

        let mut attempt = 1;
        loop {
            self.wait_if_needed().await;
            debug!(url, soap_action, attempt, "submitting to AEAT");

            let result = self.transport.post_xml(url, soap_action, &envelope).await;
            self.last_request = Some(Instant::now());

            match result {
                Ok(body) => {
                    let response = parse_response(&body)?;
                    if let Some(wait) = response.wait_seconds {
                        debug!(wait, "AEAT updated flow-control wait");
                        self.wait_secs = wait;
                    }
                    return Ok(response);
                }
                Err(err) if attempt < TRANSPORT_MAX_ATTEMPTS => {
                    warn!(attempt, error = %err, "transport failure, retrying");
                    tokio::time::sleep(TRANSPORT_RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn wait_if_needed(&self) {
        let remaining = self.time_to_next_send();
        if !remaining.is_zero() {
            debug!(?remaining, "flow control: waiting before next request");
            tokio::time::sleep(remaining).await;
        }
    }
}

fn looks_like_html(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(15).collect::<String>().to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

/// Parse a SOAP response from the authority.
///
/// Field names follow the SuministroLR response vocabulary: EstadoEnvio,
/// CSV, TiempoEsperaEnvio, RegistrosAceptados/Rechazados and the
/// CodigoError/DescripcionError pairs of rejection blocks.
pub fn parse_response(body: &str) -> Result<AeatResponse, AeatError> {
    if looks_like_html(body) {
        return Err(AeatError::EndpointUnavailable(
            "endpoint returned an HTML page instead of a SOAP response".into(),
        ));
    }

    let mut reader = Reader::from_reader(body.as_bytes());
    let mut buf = Vec::new();

    let mut saw_soap_body = false;
    let mut current: Option<String> = None;
    let mut estado = String::new();
    let mut csv = None;
    let mut wait_seconds = None;
    let mut accepted_count = None;
    let mut rejected_count = None;
    let mut errors: Vec<AeatRecordError> = Vec::new();
    let mut pending_code: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let local = e.local_name();
                let name = String::from_utf8_lossy(local.as_ref()).to_string();
                if name == "Body" {
                    saw_soap_body = true;
                }
                current = Some(name);
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| AeatError::Parse(e.to_string()))?
                    .trim()
                    .to_string();
                if text.is_empty() {
                    buf.clear();
                    continue;
                }
                match current.as_deref() {
                    Some("EstadoEnvio") => estado = text,
                    Some("CSV") => csv = Some(text),
                    Some("TiempoEsperaEnvio") => wait_seconds = text.parse().ok(),
                    Some("RegistrosAceptados") => accepted_count = text.parse().ok(),
                    Some("RegistrosRechazados") => rejected_count = text.parse().ok(),
                    Some("CodigoError") | Some("CodigoErrorRegistro") => {
                        if let Some(code) = pending_code.take() {
                            errors.push(AeatRecordError {
                                code,
                                description: "Error desconocido".into(),
                            });
                        }
                        pending_code = Some(text);
                    }
                    Some("DescripcionError") | Some("DescripcionErrorRegistro") => {
                        errors.push(AeatRecordError {
                            code: pending_code.take().unwrap_or_else(|| "UNKNOWN".into()),
                            description: text,
                        });
                    }
                    _ => {}
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(e) => return Err(AeatError::Parse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if let Some(code) = pending_code.take() {
        errors.push(AeatRecordError {
            code,
            description: "Error desconocido".into(),
        });
    }

    if !saw_soap_body {
        return Err(AeatError::Parse("no SOAP body in response".into()));
    }

    let estado_norm = estado.to_lowercase().replace('_', "");
    let accepted = estado_norm == "correcto"
        || estado_norm == "parcialmentecorrecto"
        || (csv.is_some() && errors.is_empty());

    Ok(AeatResponse {
        accepted,
        csv,
        wait_seconds,
        accepted_count,
        rejected_count,
        errors,
        raw: body.to_string(),
    })
}
