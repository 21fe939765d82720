//! Durable state: the dispatch queue, per-invoice chain anchors and issuer
//! settings, all under the `verifactu` schema.
//!
//! Events are never deleted; the queue doubles as the audit trail. All
//! status transitions are single atomic updates, and claiming an event is a
//! conditional `pending -> sending` update so that two concurrent
//! invocations can never double-send the same row.
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;
use verifactu_core::config::Environment;
use verifactu_core::registro::{
    ChainAnchor, ClientRef, CompanyRef, InvoiceLine, InvoiceRecord, IssuerSettings,
};

use crate::error::{AppError, Result};

/// Queue row. Status lifecycle: pending -> sending -> accepted | rejected,
/// with rejected optionally reset to pending by a manual retry.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DispatchEvent {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub event_type: String,
    pub status: String,
    pub attempts: i32,
    pub sent_at: Option<DateTime<Utc>>,
    pub response: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Chain/meta row mirrored to the UI.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct InvoiceMeta {
    pub invoice_id: Uuid,
    pub issuer_nif: String,
    pub invoice_number: Option<String>,
    pub issue_date: Option<String>,
    pub chain_hash: Option<String>,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

/// Health counters for the `health` action.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub pending: i64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_accepted_at: Option<DateTime<Utc>>,
    pub last_rejected_at: Option<DateTime<Utc>>,
}

/// Issuer settings row, including the encrypted certificate columns.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SettingsRow {
    pub issuer_nif: String,
    pub issuer_name: String,
    pub environment: String,
    pub software_code: Option<String>,
    pub software_name: Option<String>,
    pub software_version: Option<String>,
    pub producer_nif: Option<String>,
    pub producer_name: Option<String>,
    pub installation_number: Option<String>,
    pub cert_pem_enc: Option<String>,
    pub key_pem_enc: Option<String>,
    pub key_pass_enc: Option<String>,
}

impl SettingsRow {
    pub fn issuer_settings(&self) -> Result<IssuerSettings> {
        let environment = Environment::from_str(&self.environment)
            .map_err(|e| AppError::Configuration(e.to_string()))?;
        Ok(IssuerSettings {
            issuer_nif: self.issuer_nif.clone(),
            issuer_name: self.issuer_name.clone(),
            environment,
            software_code: self.software_code.clone(),
            software_name: self.software_name.clone(),
            software_version: self.software_version.clone(),
            producer_nif: self.producer_nif.clone(),
            producer_name: self.producer_name.clone(),
            installation_number: self.installation_number.clone(),
        })
    }
}

/// Invoice input contract plus the owning company, as loaded for one event.
#[derive(Debug, Clone)]
pub struct LoadedInvoice {
    pub company_id: Uuid,
    pub record: InvoiceRecord,
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Oldest-first batch of pending events.
    pub async fn fetch_pending(&self, limit: i64) -> Result<Vec<DispatchEvent>> {
        let events = sqlx::query_as::<_, DispatchEvent>(
            "SELECT id, invoice_id, event_type, status, attempts, sent_at, response, last_error, created_at \
             FROM verifactu.events WHERE status = 'pending' ORDER BY created_at ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    /// Atomically move an event from `pending` to `sending`, stamping
    /// sent_at. Returns false when another invocation already claimed it.
    pub async fn claim(&self, event_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE verifactu.events SET status = 'sending', sent_at = now() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_accepted(
        &self,
        event_id: Uuid,
        response: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE verifactu.events SET status = 'accepted', response = $2, last_error = NULL \
             WHERE id = $1",
        )
        .bind(event_id)
        .bind(response)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed attempt: back to `pending` while attempts remain,
    /// terminally `rejected` once the cap is reached.
    pub async fn record_failure(
        &self,
        event_id: Uuid,
        attempts: i32,
        terminal: bool,
        last_error: &str,
        response: Option<&serde_json::Value>,
    ) -> Result<()> {
        let status = if terminal { "rejected" } else { "pending" };
        sqlx::query(
            "UPDATE verifactu.events SET status = $2, attempts = $3, last_error = $4, \
             response = COALESCE($5, response) WHERE id = $1",
        )
        .bind(event_id)
        .bind(status)
        .bind(attempts)
        .bind(last_error)
        .bind(response)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Manual retry: reset the most recent rejected event for an invoice
    /// back to pending without touching its attempt counter.
    pub async fn reset_latest_rejected(&self, invoice_id: Uuid) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            "UPDATE verifactu.events SET status = 'pending', last_error = NULL \
             WHERE id = (SELECT id FROM verifactu.events \
                         WHERE invoice_id = $1 AND status = 'rejected' \
                         ORDER BY created_at DESC LIMIT 1) \
             RETURNING id",
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("id")))
    }

    /// Latest accepted chain entry for an issuer, excluding the invoice
    /// currently being dispatched.
    pub async fn chain_anchor(
        &self,
        issuer_nif: &str,
        exclude_invoice: Uuid,
    ) -> Result<Option<ChainAnchor>> {
        let row = sqlx::query(
            "SELECT issuer_nif, invoice_number, issue_date, chain_hash \
             FROM verifactu.invoice_meta \
             WHERE issuer_nif = $1 AND invoice_id <> $2 AND chain_hash IS NOT NULL \
               AND status IN ('accepted', 'void') \
             ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(issuer_nif)
        .bind(exclude_invoice)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ChainAnchor {
            issuer_nif: r.get("issuer_nif"),
            serial: r
                .get::<Option<String>, _>("invoice_number")
                .unwrap_or_default(),
            issue_date: r.get::<Option<String>, _>("issue_date").unwrap_or_default(),
            huella: r.get::<Option<String>, _>("chain_hash").unwrap_or_default(),
        }))
    }

    /// Persist the accepted registro's identity and huella so the next
    /// dispatch for this issuer chains onto it.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_acceptance_meta(
        &self,
        invoice_id: Uuid,
        issuer_nif: &str,
        invoice_number: &str,
        issue_date: &str,
        huella: &str,
        status: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO verifactu.invoice_meta \
             (invoice_id, issuer_nif, invoice_number, issue_date, chain_hash, status, payload, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, now()) \
             ON CONFLICT (invoice_id) DO UPDATE SET \
               issuer_nif = EXCLUDED.issuer_nif, invoice_number = EXCLUDED.invoice_number, \
               issue_date = EXCLUDED.issue_date, chain_hash = EXCLUDED.chain_hash, \
               status = EXCLUDED.status, payload = EXCLUDED.payload, updated_at = now()",
        )
        .bind(invoice_id)
        .bind(issuer_nif)
        .bind(invoice_number)
        .bind(issue_date)
        .bind(huella)
        .bind(status)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_meta_status(&self, invoice_id: Uuid, status: &str) -> Result<()> {
        sqlx::query(
            "UPDATE verifactu.invoice_meta SET status = $2, updated_at = now() \
             WHERE invoice_id = $1",
        )
        .bind(invoice_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load the invoice input contract: header, company, client and lines.
    pub async fn invoice_record(&self, invoice_id: Uuid) -> Result<Option<LoadedInvoice>> {
        let row = sqlx::query(
            "SELECT i.id::text AS id, i.invoice_number, i.series, i.invoice_date::text AS invoice_date, \
                    i.subtotal::float8 AS subtotal, i.total_tax::float8 AS total_tax, \
                    i.total_amount::float8 AS total_amount, i.notes, i.company_id, \
                    co.name AS company_name, co.nif AS company_nif, \
                    cl.name AS client_name, COALESCE(cl.nif, cl.tax_id) AS client_tax_id, cl.country AS client_country \
             FROM invoices i \
             JOIN companies co ON co.id = i.company_id \
             LEFT JOIN clients cl ON cl.id = i.client_id \
             WHERE i.id = $1",
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let lines = sqlx::query(
            "SELECT description, quantity::float8 AS quantity, unit_price::float8 AS unit_price, \
                    tax_rate::float8 AS tax_rate, tax_amount::float8 AS tax_amount \
             FROM invoice_lines WHERE invoice_id = $1 ORDER BY id",
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;

        let client = row
            .get::<Option<String>, _>("client_name")
            .map(|name| ClientRef {
                name,
                tax_id: row.get("client_tax_id"),
                country: row.get("client_country"),
            });

        let record = InvoiceRecord {
            id: row.get("id"),
            invoice_number: row
                .get::<Option<String>, _>("invoice_number")
                .unwrap_or_default(),
            series: row.get("series"),
            invoice_date: row
                .get::<Option<String>, _>("invoice_date")
                .unwrap_or_default(),
            subtotal: row.get::<Option<f64>, _>("subtotal").unwrap_or(0.0),
            total_tax: row.get("total_tax"),
            total_amount: row.get("total_amount"),
            notes: row.get("notes"),
            company: CompanyRef {
                name: row.get("company_name"),
                nif: row.get::<Option<String>, _>("company_nif").unwrap_or_default(),
            },
            client,
            lines: lines
                .into_iter()
                .map(|l| InvoiceLine {
                    description: l
                        .get::<Option<String>, _>("description")
                        .unwrap_or_default(),
                    quantity: l.get::<Option<f64>, _>("quantity").unwrap_or(0.0),
                    unit_price: l.get::<Option<f64>, _>("unit_price").unwrap_or(0.0),
                    tax_rate: l.get("tax_rate"),
                    tax_amount: l.get("tax_amount"),
                })
                .collect(),
        };

        Ok(Some(LoadedInvoice {
            company_id: row.get("company_id"),
            record,
        }))
    }

    pub async fn issuer_settings(&self, company_id: Uuid) -> Result<Option<SettingsRow>> {
        let row = sqlx::query_as::<_, SettingsRow>(
            "SELECT issuer_nif, issuer_name, environment, software_code, software_name, \
                    software_version, producer_nif, producer_name, installation_number, \
                    cert_pem_enc, key_pem_enc, key_pass_enc \
             FROM verifactu.settings WHERE company_id = $1",
        )
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn health_summary(&self) -> Result<HealthSummary> {
        let pending: i64 =
            sqlx::query_scalar("SELECT count(*) FROM verifactu.events WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        let last_event_at: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT max(created_at) FROM verifactu.events")
                .fetch_one(&self.pool)
                .await?;
        let last_accepted_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT max(created_at) FROM verifactu.events WHERE status = 'accepted'",
        )
        .fetch_one(&self.pool)
        .await?;
        let last_rejected_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT max(created_at) FROM verifactu.events WHERE status = 'rejected'",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(HealthSummary {
            pending,
            last_event_at,
            last_accepted_at,
            last_rejected_at,
        })
    }

    pub async fn meta_for_invoice(&self, invoice_id: Uuid) -> Result<Option<InvoiceMeta>> {
        let meta = sqlx::query_as::<_, InvoiceMeta>(
            "SELECT invoice_id, issuer_nif, invoice_number, issue_date, chain_hash, status, updated_at \
             FROM verifactu.invoice_meta WHERE invoice_id = $1",
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(meta)
    }

    pub async fn events_for_invoice(
        &self,
        invoice_id: Uuid,
        limit: i64,
    ) -> Result<Vec<DispatchEvent>> {
        let events = sqlx::query_as::<_, DispatchEvent>(
            "SELECT id, invoice_id, event_type, status, attempts, sent_at, response, last_error, created_at \
             FROM verifactu.events WHERE invoice_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(invoice_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    /// Company owning an invoice, for caller-identity checks.
    pub async fn invoice_company(&self, invoice_id: Uuid) -> Result<Option<Uuid>> {
        let company = sqlx::query_scalar::<_, Uuid>(
            "SELECT company_id FROM invoices WHERE id = $1",
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(company)
    }

    /// Company a user belongs to, for caller-identity checks.
    pub async fn user_company(&self, user_id: Uuid) -> Result<Option<Uuid>> {
        let company = sqlx::query_scalar::<_, Uuid>(
            "SELECT company_id FROM users WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(company)
    }
}
