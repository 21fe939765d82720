//! End-to-end pipeline: invoice -> registro -> XML -> signed document.
use std::path::Path;
use verifactu_core::config::Environment;
use verifactu_core::registro::xml::{registro_xml, suministro_xml, Cabecera};
use verifactu_core::registro::{
    self, ChainAnchor, ClientRef, CompanyRef, InvoiceLine, InvoiceRecord, IssuerSettings, Registro,
};
use verifactu_core::xades::XadesSigner;

fn settings() -> IssuerSettings {
    IssuerSettings {
        issuer_nif: "B12345678".into(),
        issuer_name: "Talleres Ejemplo SL".into(),
        environment: Environment::Pre,
        software_code: Some("TX01".into()),
        software_name: Some("Facturador".into()),
        software_version: Some("1.4.0".into()),
        producer_nif: None,
        producer_name: None,
        installation_number: Some("001".into()),
    }
}

fn invoice() -> InvoiceRecord {
    InvoiceRecord {
        id: "7b0b9d5e-inv".into(),
        invoice_number: "0101".into(),
        series: Some("2025-".into()),
        invoice_date: "2025-04-02".into(),
        subtotal: 200.0,
        total_tax: Some(42.0),
        total_amount: Some(242.0),
        notes: None,
        company: CompanyRef {
            name: "Talleres Ejemplo SL".into(),
            nif: "B12345678".into(),
        },
        client: Some(ClientRef {
            name: "Cliente Industrial SA".into(),
            tax_id: Some("A11111111".into()),
            country: None,
        }),
        lines: vec![InvoiceLine {
            description: "Revisión anual".into(),
            quantity: 1.0,
            unit_price: 200.0,
            tax_rate: Some(21.0),
            tax_amount: Some(42.0),
        }],
    }
}

#[test]
fn chained_registro_embeds_previous_hash_in_xml() {
    let generated_at = "2025-04-02T12:00:00+02:00";

    let first = registro::to_alta(&invoice(), &settings(), None, generated_at).expect("first alta");
    let anchor = ChainAnchor {
        issuer_nif: "B12345678".into(),
        serial: "2025-0101".into(),
        issue_date: "02-04-2025".into(),
        huella: first.huella().to_string(),
    };

    let mut second_invoice = invoice();
    second_invoice.invoice_number = "0102".into();
    let second = registro::to_alta(&second_invoice, &settings(), Some(&anchor), generated_at)
        .expect("second alta");

    // The second record links to exactly the first record's huella.
    let xml = registro_xml(&second);
    assert!(xml.contains(&format!("<sf:Huella>{}</sf:Huella>", first.huella())));
    assert!(xml.contains("<sf:NumSerieFactura>2025-0101</sf:NumSerieFactura>"));
    assert!(!xml.contains("PrimerRegistro"));

    // The first record renders the explicit first-in-chain marker.
    let first_xml = registro_xml(&first);
    assert!(first_xml.contains("<sf:PrimerRegistro>S</sf:PrimerRegistro>"));
}

#[test]
fn recomputing_a_registro_yields_the_same_huella() {
    let generated_at = "2025-04-02T12:00:00+02:00";
    let a = registro::to_alta(&invoice(), &settings(), None, generated_at).expect("alta");
    let b = registro::to_alta(&invoice(), &settings(), None, generated_at).expect("alta");
    assert_eq!(a.huella(), b.huella());
    assert_eq!(registro_xml(&a), registro_xml(&b));
}

#[test]
fn suministro_document_signs_end_to_end() {
    let generated_at = "2025-04-02T12:00:00+02:00";
    let registro = registro::to_alta(&invoice(), &settings(), None, generated_at).expect("alta");
    let cabecera = Cabecera::for_issuer(&settings(), false);
    let xml = suministro_xml(&cabecera, std::slice::from_ref(&registro));

    let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
    let cert = std::fs::read_to_string(fixtures.join("cert.pem")).expect("cert");
    let key = std::fs::read_to_string(fixtures.join("key.pem")).expect("key");
    let signer = XadesSigner::from_pem(&cert, &key, None).expect("signer");

    let signed = signer.sign_enveloped(&xml).expect("sign");
    let signature_pos = signed.find("<ds:Signature").expect("signature present");
    let closing_pos = signed
        .rfind("</sf:RegFactuSistemaFacturacion>")
        .expect("root closing tag");
    assert!(signature_pos < closing_pos);

    // Signing never mutates the signed-over content.
    match &registro {
        Registro::Alta(alta) => {
            assert!(signed.contains(&format!("<sf:Huella>{}</sf:Huella>", alta.huella)));
        }
        Registro::Anulacion(_) => unreachable!(),
    }
}
