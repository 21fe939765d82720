//! Invoice to registro transformation.
use super::hash::{alta_hash, anulacion_hash, format_date_aeat, DateError};
use super::{
    ChainAnchor, ChainLink, InvoiceId, InvoiceKind, InvoiceLine, InvoiceRecord, IssuerSettings,
    Recipient, RecordField, Registro, RegistroAlta, RegistroAnulacion, TaxBreakdown,
    ValidationError, ValidationIssue, ValidationKind, DESCRIPTION_MAX, STANDARD_VAT_RATE,
};

/// Amount threshold below which an invoice without a recipient id may be
/// issued simplified (F2).
const SIMPLIFIED_LIMIT: f64 = 400.0;

/// Compose the reportable invoice number: `series + number` when the invoice
/// belongs to a series.
pub fn compose_invoice_number(invoice: &InvoiceRecord) -> String {
    match invoice.series.as_deref() {
        Some(series) if !series.is_empty() => format!("{series}{}", invoice.invoice_number),
        _ => invoice.invoice_number.clone(),
    }
}

/// Check that the invoice carries the mandatory reporting fields.
///
/// All problems are reported at once so the caller can persist a complete
/// failure reason.
pub fn validate(invoice: &InvoiceRecord) -> Result<(), ValidationError> {
    let mut issues = Vec::new();

    if invoice.invoice_number.trim().is_empty() {
        issues.push(ValidationIssue {
            field: RecordField::InvoiceNumber,
            kind: ValidationKind::Missing,
        });
    }

    if invoice.invoice_date.trim().is_empty() {
        issues.push(ValidationIssue {
            field: RecordField::IssueDate,
            kind: ValidationKind::Missing,
        });
    } else if let Err(DateError::Unparseable(_)) = format_date_aeat(&invoice.invoice_date) {
        issues.push(ValidationIssue {
            field: RecordField::IssueDate,
            kind: ValidationKind::InvalidDate,
        });
    }

    if invoice.total_amount.is_none() {
        issues.push(ValidationIssue {
            field: RecordField::TotalAmount,
            kind: ValidationKind::Missing,
        });
    }

    if invoice.company.nif.trim().is_empty() {
        issues.push(ValidationIssue {
            field: RecordField::IssuerNif,
            kind: ValidationKind::Missing,
        });
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(issues))
    }
}

fn client_tax_id(invoice: &InvoiceRecord) -> Option<&str> {
    invoice
        .client
        .as_ref()
        .and_then(|c| c.tax_id.as_deref())
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

/// Classify the invoice type: a recipient with a tax id yields F1, low-value
/// invoices without one are simplified (F2), everything else defaults to F1.
fn classify(invoice: &InvoiceRecord, total_amount: f64) -> InvoiceKind {
    if client_tax_id(invoice).is_some() {
        return InvoiceKind::F1;
    }
    if total_amount <= SIMPLIFIED_LIMIT {
        return InvoiceKind::F2;
    }
    InvoiceKind::F1
}

/// A Spanish NIF: optional leading letter, 7-8 digits, optional trailing
/// letter. Anything else is treated as a foreign identifier.
fn looks_like_spanish_nif(id: &str) -> bool {
    let bytes = id.as_bytes();
    if bytes.is_empty() {
        return false;
    }
    let mut rest = bytes;
    if rest[0].is_ascii_alphabetic() {
        rest = &rest[1..];
    }
    let trailing = matches!(rest.last(), Some(b) if b.is_ascii_alphabetic());
    let digits = if trailing { &rest[..rest.len() - 1] } else { rest };
    (7..=8).contains(&digits.len()) && digits.iter().all(u8::is_ascii_digit)
}

/// Group invoice lines by tax rate, summing `quantity x unit_price` as the
/// taxable base and the accumulated tax as the charged tax. Lines without a
/// rate fall into the standard-rate group; an invoice without lines yields a
/// single empty group at the standard rate.
fn group_lines_by_rate(lines: &[InvoiceLine]) -> Vec<(f64, f64, f64)> {
    if lines.is_empty() {
        return vec![(STANDARD_VAT_RATE, 0.0, 0.0)];
    }

    let mut groups: Vec<(f64, f64, f64)> = Vec::new();
    for line in lines {
        let rate = line.tax_rate.unwrap_or(STANDARD_VAT_RATE);
        let base = line.quantity * line.unit_price;
        let tax = line.tax_amount.unwrap_or(0.0);
        match groups.iter_mut().find(|(r, _, _)| *r == rate) {
            Some(group) => {
                group.1 += base;
                group.2 += tax;
            }
            None => groups.push((rate, base, tax)),
        }
    }
    groups
}

fn operation_description(invoice: &InvoiceRecord) -> String {
    let description = match invoice.notes.as_deref().map(str::trim) {
        Some(notes) if !notes.is_empty() => notes.to_string(),
        _ if !invoice.lines.is_empty() => invoice
            .lines
            .iter()
            .map(|l| l.description.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        _ => "Servicios profesionales".to_string(),
    };
    description.chars().take(DESCRIPTION_MAX).collect()
}

fn invalid_date() -> ValidationError {
    ValidationError::new(vec![ValidationIssue {
        field: RecordField::IssueDate,
        kind: ValidationKind::InvalidDate,
    }])
}

fn missing_amount() -> ValidationError {
    ValidationError::new(vec![ValidationIssue {
        field: RecordField::TotalAmount,
        kind: ValidationKind::Missing,
    }])
}

fn recipient_for(invoice: &InvoiceRecord) -> Option<Recipient> {
    let client = invoice.client.as_ref()?;
    let id = client_tax_id(invoice)?;
    if looks_like_spanish_nif(id) {
        Some(Recipient::Nif {
            nif: id.to_ascii_uppercase(),
            name: client.name.clone(),
        })
    } else {
        Some(Recipient::Foreign {
            country: client.country.clone().unwrap_or_else(|| "ES".into()),
            id_type: "02".into(),
            id: id.to_string(),
            name: client.name.clone(),
        })
    }
}

/// Transform an invoice into a registration record (alta), chaining it to
/// the previous accepted record when one exists.
///
/// `generated_at` is the generation timestamp that enters both the record
/// and its huella; pass [`super::hash::generation_timestamp`]'s output in
/// production code and a fixed value in tests.
///
/// # Errors
/// Returns [`ValidationError`] when mandatory fields are missing or the
/// issue date cannot be normalized.
pub fn to_alta(
    invoice: &InvoiceRecord,
    settings: &IssuerSettings,
    previous: Option<&ChainAnchor>,
    generated_at: &str,
) -> Result<Registro, ValidationError> {
    validate(invoice)?;

    let serial = compose_invoice_number(invoice);
    let issue_date = format_date_aeat(&invoice.invoice_date).map_err(|_| invalid_date())?;
    let total_tax = invoice.total_tax.unwrap_or(0.0);
    let total_amount = invoice.total_amount.ok_or_else(missing_amount)?;
    let kind = classify(invoice, total_amount);

    let huella = alta_hash(
        &settings.issuer_nif,
        &serial,
        &issue_date,
        kind.code(),
        total_tax,
        total_amount,
        previous.map(|p| p.huella.as_str()),
        generated_at,
    );

    let breakdown = group_lines_by_rate(&invoice.lines)
        .into_iter()
        .map(|(rate, base, tax)| TaxBreakdown {
            regime_key: "01".into(),
            qualification: "S1".into(),
            rate,
            base,
            tax,
        })
        .collect();

    let recipient = recipient_for(invoice);
    // A named client without any usable id gets the art. 61d marker,
    // except on simplified invoices where the schema already implies it.
    let no_recipient_id =
        recipient.is_none() && invoice.client.is_some() && kind != InvoiceKind::F2;

    Ok(Registro::Alta(RegistroAlta {
        invoice_id: InvoiceId {
            issuer_nif: settings.issuer_nif.clone(),
            serial,
            issue_date,
        },
        external_ref: Some(invoice.id.clone()),
        issuer_name: settings.issuer_name.clone(),
        kind,
        rectification_type: None,
        rectified: Vec::new(),
        rectification_amount: None,
        description: operation_description(invoice),
        no_recipient_id,
        recipient,
        breakdown,
        total_tax,
        total_amount,
        previous: previous.map(ChainLink::from_anchor),
        sistema: settings.sistema(),
        generated_at: generated_at.to_string(),
        huella,
    }))
}

/// Transform an invoice into a cancellation record (anulación).
///
/// # Errors
/// Returns [`ValidationError`] under the same rules as [`to_alta`].
pub fn to_anulacion(
    invoice: &InvoiceRecord,
    settings: &IssuerSettings,
    previous: Option<&ChainAnchor>,
    generated_at: &str,
) -> Result<Registro, ValidationError> {
    validate(invoice)?;

    let serial = compose_invoice_number(invoice);
    let issue_date = format_date_aeat(&invoice.invoice_date).map_err(|_| invalid_date())?;

    let huella = anulacion_hash(
        &settings.issuer_nif,
        &serial,
        &issue_date,
        previous.map(|p| p.huella.as_str()),
        generated_at,
    );

    Ok(Registro::Anulacion(RegistroAnulacion {
        invoice_id: InvoiceId {
            issuer_nif: settings.issuer_nif.clone(),
            serial,
            issue_date,
        },
        external_ref: Some(invoice.id.clone()),
        generated_by: "E".into(),
        previous: previous.map(ChainLink::from_anchor),
        sistema: settings.sistema(),
        generated_at: generated_at.to_string(),
        huella,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::registro::{ClientRef, CompanyRef};

    fn settings() -> IssuerSettings {
        IssuerSettings {
            issuer_nif: "B12345678".into(),
            issuer_name: "Acme SL".into(),
            environment: Environment::Pre,
            software_code: Some("SF01".into()),
            software_name: Some("Facturador".into()),
            software_version: Some("2.3.1".into()),
            producer_nif: None,
            producer_name: None,
            installation_number: None,
        }
    }

    fn invoice() -> InvoiceRecord {
        InvoiceRecord {
            id: "inv-1".into(),
            invoice_number: "0042".into(),
            series: Some("A-".into()),
            invoice_date: "2025-03-15".into(),
            subtotal: 150.0,
            total_tax: Some(26.0),
            total_amount: Some(176.0),
            notes: None,
            company: CompanyRef {
                name: "Acme SL".into(),
                nif: "B12345678".into(),
            },
            client: Some(ClientRef {
                name: "Cliente SA".into(),
                tax_id: Some("A87654321".into()),
                country: None,
            }),
            lines: vec![
                InvoiceLine {
                    description: "Mano de obra".into(),
                    quantity: 2.0,
                    unit_price: 50.0,
                    tax_rate: Some(21.0),
                    tax_amount: Some(21.0),
                },
                InvoiceLine {
                    description: "Recambios".into(),
                    quantity: 1.0,
                    unit_price: 50.0,
                    tax_rate: Some(10.0),
                    tax_amount: Some(5.0),
                },
            ],
        }
    }

    #[test]
    fn composes_invoice_number_with_series() {
        assert_eq!(compose_invoice_number(&invoice()), "A-0042");
        let mut no_series = invoice();
        no_series.series = None;
        assert_eq!(compose_invoice_number(&no_series), "0042");
    }

    #[test]
    fn groups_lines_by_tax_rate() {
        let Registro::Alta(alta) =
            to_alta(&invoice(), &settings(), None, "2025-03-15T10:00:00+01:00").unwrap()
        else {
            panic!("expected alta");
        };

        assert_eq!(alta.breakdown.len(), 2);
        let at_21 = alta.breakdown.iter().find(|g| g.rate == 21.0).unwrap();
        assert_eq!(at_21.base, 100.0);
        assert_eq!(at_21.tax, 21.0);
        let at_10 = alta.breakdown.iter().find(|g| g.rate == 10.0).unwrap();
        assert_eq!(at_10.base, 50.0);
        assert_eq!(at_10.tax, 5.0);
        assert_eq!(alta.total_tax, 26.0);
    }

    #[test]
    fn no_lines_yields_single_standard_group() {
        let mut inv = invoice();
        inv.lines.clear();
        inv.notes = Some("Iguala mensual".into());
        let Registro::Alta(alta) = to_alta(&inv, &settings(), None, "t").unwrap() else {
            panic!("expected alta");
        };
        assert_eq!(alta.breakdown.len(), 1);
        assert_eq!(alta.breakdown[0].rate, STANDARD_VAT_RATE);
        assert_eq!(alta.breakdown[0].base, 0.0);
    }

    #[test]
    fn classification_follows_recipient_and_amount() {
        // Recipient with NIF: F1.
        let Registro::Alta(alta) = to_alta(&invoice(), &settings(), None, "t").unwrap() else {
            panic!("expected alta");
        };
        assert_eq!(alta.kind, InvoiceKind::F1);
        assert!(matches!(alta.recipient, Some(Recipient::Nif { .. })));

        // No recipient id, low amount: F2 without destinatario block.
        let mut small = invoice();
        small.client = None;
        small.total_amount = Some(120.0);
        let Registro::Alta(alta) = to_alta(&small, &settings(), None, "t").unwrap() else {
            panic!("expected alta");
        };
        assert_eq!(alta.kind, InvoiceKind::F2);
        assert!(alta.recipient.is_none());

        // No recipient id, high amount: back to F1.
        let mut large = invoice();
        large.client = None;
        large.total_amount = Some(900.0);
        let Registro::Alta(alta) = to_alta(&large, &settings(), None, "t").unwrap() else {
            panic!("expected alta");
        };
        assert_eq!(alta.kind, InvoiceKind::F1);
    }

    #[test]
    fn foreign_tax_id_maps_to_id_otro() {
        let mut inv = invoice();
        inv.client = Some(ClientRef {
            name: "Fremde GmbH".into(),
            tax_id: Some("DE129273398".into()),
            country: Some("DE".into()),
        });
        let Registro::Alta(alta) = to_alta(&inv, &settings(), None, "t").unwrap() else {
            panic!("expected alta");
        };
        match alta.recipient {
            Some(Recipient::Foreign {
                ref country,
                ref id_type,
                ref id,
                ..
            }) => {
                assert_eq!(country, "DE");
                assert_eq!(id_type, "02");
                assert_eq!(id, "DE129273398");
            }
            other => panic!("expected foreign recipient, got {:?}", other),
        }
    }

    #[test]
    fn validate_reports_all_missing_fields_at_once() {
        let inv = InvoiceRecord {
            id: "inv-2".into(),
            invoice_number: "".into(),
            series: None,
            invoice_date: "".into(),
            subtotal: 0.0,
            total_tax: None,
            total_amount: None,
            notes: None,
            company: CompanyRef {
                name: "Acme SL".into(),
                nif: "  ".into(),
            },
            client: None,
            lines: Vec::new(),
        };
        let err = validate(&inv).expect_err("expected validation error");
        let fields: Vec<_> = err.issues.iter().map(|i| i.field).collect();
        assert!(fields.contains(&RecordField::InvoiceNumber));
        assert!(fields.contains(&RecordField::IssueDate));
        assert!(fields.contains(&RecordField::TotalAmount));
        assert!(fields.contains(&RecordField::IssuerNif));
    }

    #[test]
    fn validate_flags_bad_dates() {
        let mut inv = invoice();
        inv.invoice_date = "next tuesday".into();
        let err = validate(&inv).expect_err("expected validation error");
        assert!(err
            .issues
            .iter()
            .any(|i| i.field == RecordField::IssueDate && i.kind == ValidationKind::InvalidDate));
    }

    #[test]
    fn chain_link_truncates_previous_huella() {
        let anchor = ChainAnchor {
            issuer_nif: "B12345678".into(),
            serial: "A-0041".into(),
            issue_date: "14-03-2025".into(),
            huella: "f".repeat(80),
        };
        let Registro::Alta(alta) =
            to_alta(&invoice(), &settings(), Some(&anchor), "t").unwrap()
        else {
            panic!("expected alta");
        };
        let link = alta.previous.expect("chain link");
        assert_eq!(link.huella.len(), 64);
        assert_eq!(link.serial, "A-0041");
    }

    #[test]
    fn description_prefers_notes_and_truncates() {
        let mut inv = invoice();
        inv.notes = Some("x".repeat(600));
        let Registro::Alta(alta) = to_alta(&inv, &settings(), None, "t").unwrap() else {
            panic!("expected alta");
        };
        assert_eq!(alta.description.chars().count(), DESCRIPTION_MAX);

        let mut inv = invoice();
        inv.notes = None;
        let Registro::Alta(alta) = to_alta(&inv, &settings(), None, "t").unwrap() else {
            panic!("expected alta");
        };
        assert_eq!(alta.description, "Mano de obra, Recambios");
    }

    #[test]
    fn anulacion_carries_generator_and_chain() {
        let anchor = ChainAnchor {
            issuer_nif: "B12345678".into(),
            serial: "A-0041".into(),
            issue_date: "14-03-2025".into(),
            huella: "ab".repeat(32),
        };
        let Registro::Anulacion(anulacion) =
            to_anulacion(&invoice(), &settings(), Some(&anchor), "t").unwrap()
        else {
            panic!("expected anulacion");
        };
        assert_eq!(anulacion.generated_by, "E");
        assert!(anulacion.previous.is_some());
        assert_eq!(anulacion.huella.len(), 64);
    }
}
