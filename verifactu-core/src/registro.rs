//! Registro domain types and invoice transformation.
pub mod hash;
mod transform;
pub mod xml;

pub use transform::{compose_invoice_number, to_alta, to_anulacion, validate};

use crate::config::{Environment, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schema version tag emitted on every registro.
pub const ID_VERSION: &str = "1.0";

/// Maximum length of the operation description accepted by the schema.
pub const DESCRIPTION_MAX: usize = 500;

/// Standard VAT rate applied when line items carry no rate of their own.
pub const STANDARD_VAT_RATE: f64 = 21.0;

/// Structured validation error with field-level issues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invoice is not reportable")]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn new(issues: Vec<ValidationIssue>) -> Self {
        Self { issues }
    }
}

/// Single validation issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: RecordField,
    pub kind: ValidationKind,
}

/// Field associated with a validation issue.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordField {
    InvoiceNumber,
    IssueDate,
    TotalAmount,
    IssuerNif,
}

/// Classification of validation issues.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    Missing,
    InvalidDate,
}

/// Issuing company of an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyRef {
    pub name: String,
    pub nif: String,
}

/// Invoice recipient as supplied by the billing system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRef {
    pub name: String,
    pub tax_id: Option<String>,
    pub country: Option<String>,
}

/// Single invoice line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub tax_rate: Option<f64>,
    pub tax_amount: Option<f64>,
}

/// Input contract for the transformer: a locally issued invoice with its
/// company, recipient and lines. Immutable once handed to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: String,
    pub invoice_number: String,
    pub series: Option<String>,
    pub invoice_date: String,
    pub subtotal: f64,
    pub total_tax: Option<f64>,
    pub total_amount: Option<f64>,
    pub notes: Option<String>,
    pub company: CompanyRef,
    pub client: Option<ClientRef>,
    pub lines: Vec<InvoiceLine>,
}

/// Reporting-software identity block (SistemaInformatico).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SistemaInformatico {
    pub producer_nif: String,
    pub producer_name: String,
    pub system_id: String,
    pub system_name: String,
    pub version: String,
    pub installation_number: String,
    /// TipoUsoPosibleSoloVerifactu.
    pub verifactu_only: bool,
    /// TipoUsoPosibleMultiOT.
    pub multi_user: bool,
}

/// Per-issuer VeriFactu settings, as persisted by the surrounding system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuerSettings {
    pub issuer_nif: String,
    pub issuer_name: String,
    pub environment: Environment,
    pub software_code: Option<String>,
    pub software_name: Option<String>,
    pub software_version: Option<String>,
    pub producer_nif: Option<String>,
    pub producer_name: Option<String>,
    pub installation_number: Option<String>,
}

impl IssuerSettings {
    /// Resolve the software identity block, falling back to the issuer's own
    /// identity where producer fields are absent.
    pub fn sistema(&self) -> SistemaInformatico {
        SistemaInformatico {
            producer_nif: self
                .producer_nif
                .clone()
                .unwrap_or_else(|| self.issuer_nif.clone()),
            producer_name: self
                .producer_name
                .clone()
                .unwrap_or_else(|| self.issuer_name.clone()),
            system_id: self.software_code.clone().unwrap_or_else(|| "01".into()),
            system_name: self
                .software_name
                .clone()
                .unwrap_or_else(|| "VeriFactu".into()),
            version: self
                .software_version
                .clone()
                .unwrap_or_else(|| "1.0.0".into()),
            installation_number: self
                .installation_number
                .clone()
                .unwrap_or_else(|| "001".into()),
            verifactu_only: true,
            multi_user: true,
        }
    }
}

/// Most recently accepted record for an issuer, used as the previous link
/// when chaining the next registro.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainAnchor {
    pub issuer_nif: String,
    pub serial: String,
    pub issue_date: String,
    pub huella: String,
}

/// Encadenamiento reference embedded in a registro. Carries only the first
/// 64 characters of the previous huella.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub issuer_nif: String,
    pub serial: String,
    pub issue_date: String,
    pub huella: String,
}

impl ChainLink {
    pub fn from_anchor(anchor: &ChainAnchor) -> Self {
        ChainLink {
            issuer_nif: anchor.issuer_nif.clone(),
            serial: anchor.serial.clone(),
            issue_date: anchor.issue_date.clone(),
            huella: anchor.huella.chars().take(64).collect(),
        }
    }
}

/// Invoice type codes of the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceKind {
    /// Standard invoice.
    F1,
    /// Simplified invoice.
    F2,
    /// Substitutive of simplified invoices.
    F3,
    R1,
    R2,
    R3,
    R4,
    R5,
}

impl InvoiceKind {
    pub fn code(&self) -> &'static str {
        match self {
            InvoiceKind::F1 => "F1",
            InvoiceKind::F2 => "F2",
            InvoiceKind::F3 => "F3",
            InvoiceKind::R1 => "R1",
            InvoiceKind::R2 => "R2",
            InvoiceKind::R3 => "R3",
            InvoiceKind::R4 => "R4",
            InvoiceKind::R5 => "R5",
        }
    }

    pub fn is_rectification(&self) -> bool {
        matches!(
            self,
            InvoiceKind::R1 | InvoiceKind::R2 | InvoiceKind::R3 | InvoiceKind::R4 | InvoiceKind::R5
        )
    }
}

/// Invoice identification triplet used across the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceId {
    pub issuer_nif: String,
    pub serial: String,
    pub issue_date: String,
}

/// Recipient identity of a registro.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Nif {
        nif: String,
        name: String,
    },
    /// Foreign recipient identified by country code and id type 02 (VAT id).
    Foreign {
        country: String,
        id_type: String,
        id: String,
        name: String,
    },
}

/// One tax-breakdown group (DetalleDesglose).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxBreakdown {
    /// ClaveRegimen, `01` for the general regime.
    pub regime_key: String,
    /// CalificacionOperacion, `S1` for a subject, non-exempt operation.
    pub qualification: String,
    pub rate: f64,
    pub base: f64,
    pub tax: f64,
}

/// Rectification amounts for R-type invoices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RectificationAmount {
    pub base: f64,
    pub tax: f64,
    pub surcharge: Option<f64>,
}

/// Registration record for a newly issued invoice.
/// Never mutated after the huella is computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistroAlta {
    pub invoice_id: InvoiceId,
    pub external_ref: Option<String>,
    pub issuer_name: String,
    pub kind: InvoiceKind,
    pub rectification_type: Option<String>,
    pub rectified: Vec<InvoiceId>,
    pub rectification_amount: Option<RectificationAmount>,
    pub description: String,
    /// FacturaSinIdentifDestinatarioArt61d marker.
    pub no_recipient_id: bool,
    pub recipient: Option<Recipient>,
    pub breakdown: Vec<TaxBreakdown>,
    pub total_tax: f64,
    pub total_amount: f64,
    pub previous: Option<ChainLink>,
    pub sistema: SistemaInformatico,
    pub generated_at: String,
    pub huella: String,
}

/// Cancellation record for a previously reported invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistroAnulacion {
    pub invoice_id: InvoiceId,
    pub external_ref: Option<String>,
    /// GeneradoPor: `E` expedidor, `D` destinatario, `T` tercero.
    pub generated_by: String,
    pub previous: Option<ChainLink>,
    pub sistema: SistemaInformatico,
    pub generated_at: String,
    pub huella: String,
}

/// Either variant of a normalized registro.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Registro {
    Alta(RegistroAlta),
    Anulacion(RegistroAnulacion),
}

impl Registro {
    pub fn huella(&self) -> &str {
        match self {
            Registro::Alta(r) => &r.huella,
            Registro::Anulacion(r) => &r.huella,
        }
    }

    pub fn invoice_id(&self) -> &InvoiceId {
        match self {
            Registro::Alta(r) => &r.invoice_id,
            Registro::Anulacion(r) => &r.invoice_id,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Registro::Alta(_) => Operation::Registration,
            Registro::Anulacion(_) => Operation::Cancellation,
        }
    }
}
