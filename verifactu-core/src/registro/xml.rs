//! XML rendering for registros (SuministroLR vocabulary).
//!
//! Element order is mandated by the SuministroLR schema, so records are
//! rendered by hand instead of through a serializer. This module performs no
//! network or cryptographic work and is tested against fixed fragments.
use super::{
    IssuerSettings, Recipient, Registro, RegistroAlta, RegistroAnulacion, SistemaInformatico,
    ID_VERSION,
};

/// Official SuministroLR namespace.
pub const VERIFACTU_NS: &str = "https://www2.agenciatributaria.gob.es/static_files/common/internet/dep/aplicaciones/es/aeat/ssii/verifactu/ws/SuministroLR.xsd";

const P: &str = "sf";

/// Header block common to every remission (Cabecera).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cabecera {
    pub issuer_nif: String,
    pub issuer_name: String,
    pub sistema: SistemaInformatico,
    /// IndicadorIncidenciaTecnica.
    pub technical_incident: bool,
    /// RefRequerimiento, only for remissions answering a requirement.
    pub requirement_ref: Option<String>,
}

impl Cabecera {
    pub fn for_issuer(settings: &IssuerSettings, technical_incident: bool) -> Self {
        Cabecera {
            issuer_nif: settings.issuer_nif.clone(),
            issuer_name: settings.issuer_name.clone(),
            sistema: settings.sistema(),
            technical_incident,
            requirement_ref: None,
        }
    }
}

/// Escape the five XML special characters in a text value.
pub(crate) fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Monetary values always render with exactly two decimals.
fn money(value: f64) -> String {
    format!("{value:.2}")
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "S"
    } else {
        "N"
    }
}

fn sistema_xml(sistema: &SistemaInformatico) -> String {
    format!(
        "\n    <{P}:SistemaInformatico>\
         \n      <{P}:NombreRazon>{name}</{P}:NombreRazon>\
         \n      <{P}:NIF>{nif}</{P}:NIF>\
         \n      <{P}:NombreSistemaInformatico>{system_name}</{P}:NombreSistemaInformatico>\
         \n      <{P}:IdSistemaInformatico>{system_id}</{P}:IdSistemaInformatico>\
         \n      <{P}:Version>{version}</{P}:Version>\
         \n      <{P}:NumeroInstalacion>{installation}</{P}:NumeroInstalacion>\
         \n      <{P}:TipoUsoPosibleSoloVerifactu>{only}</{P}:TipoUsoPosibleSoloVerifactu>\
         \n      <{P}:TipoUsoPosibleMultiOT>{multi}</{P}:TipoUsoPosibleMultiOT>\
         \n    </{P}:SistemaInformatico>",
        name = escape_xml(&sistema.producer_name),
        nif = escape_xml(&sistema.producer_nif),
        system_name = escape_xml(&sistema.system_name),
        system_id = escape_xml(&sistema.system_id),
        version = escape_xml(&sistema.version),
        installation = escape_xml(&sistema.installation_number),
        only = yes_no(sistema.verifactu_only),
        multi = yes_no(sistema.multi_user),
    )
}

fn cabecera_xml(cabecera: &Cabecera) -> String {
    let mut xml = format!(
        "\n  <{P}:Cabecera>\
         \n    <{P}:ObligadoEmision>\
         \n      <{P}:NombreRazon>{name}</{P}:NombreRazon>\
         \n      <{P}:NIF>{nif}</{P}:NIF>\
         \n    </{P}:ObligadoEmision>{sistema}",
        name = escape_xml(&cabecera.issuer_name),
        nif = escape_xml(&cabecera.issuer_nif),
        sistema = sistema_xml(&cabecera.sistema),
    );

    if cabecera.technical_incident {
        xml.push_str(&format!(
            "\n    <{P}:IndicadorIncidenciaTecnica>S</{P}:IndicadorIncidenciaTecnica>"
        ));
    }
    if let Some(reference) = &cabecera.requirement_ref {
        xml.push_str(&format!(
            "\n    <{P}:RefRequerimiento>{}</{P}:RefRequerimiento>",
            escape_xml(reference)
        ));
    }

    xml.push_str(&format!("\n  </{P}:Cabecera>"));
    xml
}

fn id_factura_xml(tag: &str, issuer_nif: &str, serial: &str, issue_date: &str) -> String {
    format!(
        "\n        <{P}:{tag}>\
         \n          <{P}:IDEmisorFactura>{nif}</{P}:IDEmisorFactura>\
         \n          <{P}:NumSerieFactura>{serial}</{P}:NumSerieFactura>\
         \n          <{P}:FechaExpedicionFactura>{date}</{P}:FechaExpedicionFactura>\
         \n        </{P}:{tag}>",
        nif = escape_xml(issuer_nif),
        serial = escape_xml(serial),
        date = issue_date,
    )
}

fn encadenamiento_xml(registro_previous: Option<&super::ChainLink>) -> String {
    match registro_previous {
        Some(previous) => format!(
            "\n        <{P}:Encadenamiento>\
             \n          <{P}:RegistroAnterior>\
             \n            <{P}:IDEmisorFactura>{nif}</{P}:IDEmisorFactura>\
             \n            <{P}:NumSerieFactura>{serial}</{P}:NumSerieFactura>\
             \n            <{P}:FechaExpedicionFactura>{date}</{P}:FechaExpedicionFactura>\
             \n            <{P}:Huella>{huella}</{P}:Huella>\
             \n          </{P}:RegistroAnterior>\
             \n        </{P}:Encadenamiento>",
            nif = escape_xml(&previous.issuer_nif),
            serial = escape_xml(&previous.serial),
            date = previous.issue_date,
            huella = previous.huella,
        ),
        // First record in the chain carries an explicit marker.
        None => format!(
            "\n        <{P}:Encadenamiento>\
             \n          <{P}:PrimerRegistro>S</{P}:PrimerRegistro>\
             \n        </{P}:Encadenamiento>"
        ),
    }
}

fn recipient_xml(recipient: &Recipient) -> String {
    let (identity, name) = match recipient {
        Recipient::Nif { nif, name } => (
            format!("\n            <{P}:NIF>{}</{P}:NIF>", escape_xml(nif)),
            name,
        ),
        Recipient::Foreign {
            country,
            id_type,
            id,
            name,
        } => (
            format!(
                "\n            <{P}:IDOtro>\
                 \n              <{P}:CodigoPais>{country}</{P}:CodigoPais>\
                 \n              <{P}:IDType>{id_type}</{P}:IDType>\
                 \n              <{P}:ID>{id}</{P}:ID>\
                 \n            </{P}:IDOtro>",
                country = escape_xml(country),
                id_type = id_type,
                id = escape_xml(id),
            ),
            name,
        ),
    };
    format!(
        "\n        <{P}:Destinatarios>\
         \n          <{P}:IDDestinatario>{identity}\
         \n            <{P}:NombreRazon>{name}</{P}:NombreRazon>\
         \n          </{P}:IDDestinatario>\
         \n        </{P}:Destinatarios>",
        name = escape_xml(name),
    )
}

fn alta_xml(registro: &RegistroAlta) -> String {
    let mut xml = format!(
        "\n      <{P}:RegistroAlta>{id}",
        id = id_factura_xml(
            "IDFactura",
            &registro.invoice_id.issuer_nif,
            &registro.invoice_id.serial,
            &registro.invoice_id.issue_date,
        )
    );

    if let Some(reference) = &registro.external_ref {
        xml.push_str(&format!(
            "\n        <{P}:RefExterna>{}</{P}:RefExterna>",
            escape_xml(reference)
        ));
    }

    xml.push_str(&format!(
        "\n        <{P}:NombreRazonEmisor>{}</{P}:NombreRazonEmisor>\
         \n        <{P}:TipoFactura>{}</{P}:TipoFactura>",
        escape_xml(&registro.issuer_name),
        registro.kind.code(),
    ));

    if let Some(kind) = &registro.rectification_type {
        xml.push_str(&format!(
            "\n        <{P}:TipoRectificativa>{kind}</{P}:TipoRectificativa>"
        ));
    }

    if !registro.rectified.is_empty() {
        xml.push_str(&format!("\n        <{P}:FacturasRectificadas>"));
        for rectified in &registro.rectified {
            xml.push_str(&id_factura_xml(
                "IDFacturaRectificada",
                &rectified.issuer_nif,
                &rectified.serial,
                &rectified.issue_date,
            ));
        }
        xml.push_str(&format!("\n        </{P}:FacturasRectificadas>"));
    }

    if let Some(amount) = &registro.rectification_amount {
        xml.push_str(&format!(
            "\n        <{P}:ImporteRectificacion>\
             \n          <{P}:BaseRectificada>{base}</{P}:BaseRectificada>\
             \n          <{P}:CuotaRectificada>{tax}</{P}:CuotaRectificada>",
            base = money(amount.base),
            tax = money(amount.tax),
        ));
        if let Some(surcharge) = amount.surcharge {
            xml.push_str(&format!(
                "\n          <{P}:CuotaRecargoRectificado>{}</{P}:CuotaRecargoRectificado>",
                money(surcharge)
            ));
        }
        xml.push_str(&format!("\n        </{P}:ImporteRectificacion>"));
    }

    xml.push_str(&format!(
        "\n        <{P}:DescripcionOperacion>{}</{P}:DescripcionOperacion>",
        escape_xml(&registro.description)
    ));

    if registro.no_recipient_id {
        xml.push_str(&format!(
            "\n        <{P}:FacturaSinIdentifDestinatarioArt61d>S</{P}:FacturaSinIdentifDestinatarioArt61d>"
        ));
    }

    if let Some(recipient) = &registro.recipient {
        xml.push_str(&recipient_xml(recipient));
    }

    xml.push_str(&format!("\n        <{P}:Desglose>"));
    for group in &registro.breakdown {
        xml.push_str(&format!(
            "\n          <{P}:DetalleDesglose>\
             \n            <{P}:ClaveRegimen>{regime}</{P}:ClaveRegimen>\
             \n            <{P}:CalificacionOperacion>{qualification}</{P}:CalificacionOperacion>\
             \n            <{P}:TipoImpositivo>{rate}</{P}:TipoImpositivo>\
             \n            <{P}:BaseImponibleOImporteNoSujeto>{base}</{P}:BaseImponibleOImporteNoSujeto>\
             \n            <{P}:CuotaRepercutida>{tax}</{P}:CuotaRepercutida>\
             \n          </{P}:DetalleDesglose>",
            regime = group.regime_key,
            qualification = group.qualification,
            rate = money(group.rate),
            base = money(group.base),
            tax = money(group.tax),
        ));
    }
    xml.push_str(&format!("\n        </{P}:Desglose>"));

    xml.push_str(&format!(
        "\n        <{P}:CuotaTotal>{tax}</{P}:CuotaTotal>\
         \n        <{P}:ImporteTotal>{amount}</{P}:ImporteTotal>{chain}{sistema}\
         \n        <{P}:FechaHoraHusoGenRegistro>{generated}</{P}:FechaHoraHusoGenRegistro>\
         \n        <{P}:TipoHuella>01</{P}:TipoHuella>\
         \n        <{P}:Huella>{huella}</{P}:Huella>\
         \n        <{P}:IDVersion>{version}</{P}:IDVersion>\
         \n      </{P}:RegistroAlta>",
        tax = money(registro.total_tax),
        amount = money(registro.total_amount),
        chain = encadenamiento_xml(registro.previous.as_ref()),
        sistema = sistema_xml(&registro.sistema),
        generated = registro.generated_at,
        huella = registro.huella,
        version = ID_VERSION,
    ));

    xml
}

fn anulacion_xml(registro: &RegistroAnulacion) -> String {
    let mut xml = format!(
        "\n      <{P}:RegistroAnulacion>{id}",
        id = id_factura_xml(
            "IDFactura",
            &registro.invoice_id.issuer_nif,
            &registro.invoice_id.serial,
            &registro.invoice_id.issue_date,
        )
    );

    if let Some(reference) = &registro.external_ref {
        xml.push_str(&format!(
            "\n        <{P}:RefExterna>{}</{P}:RefExterna>",
            escape_xml(reference)
        ));
    }

    xml.push_str(&format!(
        "\n        <{P}:GeneradoPor>{}</{P}:GeneradoPor>{chain}{sistema}\
         \n        <{P}:FechaHoraHusoGenRegistro>{generated}</{P}:FechaHoraHusoGenRegistro>\
         \n        <{P}:TipoHuella>01</{P}:TipoHuella>\
         \n        <{P}:Huella>{huella}</{P}:Huella>\
         \n        <{P}:IDVersion>{version}</{P}:IDVersion>\
         \n      </{P}:RegistroAnulacion>",
        registro.generated_by,
        chain = encadenamiento_xml(registro.previous.as_ref()),
        sistema = sistema_xml(&registro.sistema),
        generated = registro.generated_at,
        huella = registro.huella,
        version = ID_VERSION,
    ));

    xml
}

fn registro_body(registro: &Registro) -> String {
    match registro {
        Registro::Alta(alta) => alta_xml(alta),
        Registro::Anulacion(anulacion) => anulacion_xml(anulacion),
    }
}

/// Render the full RegFactuSistemaFacturacion remission for submission.
pub fn suministro_xml(cabecera: &Cabecera, registros: &[Registro]) -> String {
    let mut xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         \n<{P}:RegFactuSistemaFacturacion xmlns:{P}=\"{VERIFACTU_NS}\">{cabecera}",
        cabecera = cabecera_xml(cabecera),
    );

    for registro in registros {
        xml.push_str(&format!(
            "\n  <{P}:RegistroFactura>{body}\n  </{P}:RegistroFactura>",
            body = registro_body(registro),
        ));
    }

    xml.push_str(&format!("\n</{P}:RegFactuSistemaFacturacion>"));
    xml
}

/// Render a single registro as a standalone document, for conservation and
/// export.
pub fn registro_xml(registro: &Registro) -> String {
    let (tag, body) = match registro {
        Registro::Alta(alta) => ("RegistroAlta", alta_xml(alta)),
        Registro::Anulacion(anulacion) => ("RegistroAnulacion", anulacion_xml(anulacion)),
    };
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         \n<{P}:{tag} xmlns:{P}=\"{VERIFACTU_NS}\">{body}\n</{P}:{tag}>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registro::{ChainLink, InvoiceId, InvoiceKind, TaxBreakdown};

    fn sistema() -> SistemaInformatico {
        SistemaInformatico {
            producer_nif: "B12345678".into(),
            producer_name: "Acme SL".into(),
            system_id: "SF01".into(),
            system_name: "Facturador".into(),
            version: "2.3.1".into(),
            installation_number: "001".into(),
            verifactu_only: true,
            multi_user: true,
        }
    }

    fn alta() -> RegistroAlta {
        RegistroAlta {
            invoice_id: InvoiceId {
                issuer_nif: "B12345678".into(),
                serial: "A-0042".into(),
                issue_date: "15-03-2025".into(),
            },
            external_ref: Some("inv-1".into()),
            issuer_name: "Acme SL".into(),
            kind: InvoiceKind::F1,
            rectification_type: None,
            rectified: Vec::new(),
            rectification_amount: None,
            description: "Mano de obra".into(),
            no_recipient_id: false,
            recipient: None,
            breakdown: vec![TaxBreakdown {
                regime_key: "01".into(),
                qualification: "S1".into(),
                rate: 21.0,
                base: 100.0,
                tax: 21.0,
            }],
            total_tax: 21.0,
            total_amount: 121.0,
            previous: None,
            sistema: sistema(),
            generated_at: "2025-03-15T10:00:00+01:00".into(),
            huella: "deadbeef".into(),
        }
    }

    #[test]
    fn escapes_markup_in_text_values() {
        let mut registro = alta();
        registro.description = "Repuestos <5mm> & \"ajuste\"".into();
        let xml = registro_xml(&Registro::Alta(registro));
        assert!(xml.contains(
            "<sf:DescripcionOperacion>Repuestos &lt;5mm&gt; &amp; &quot;ajuste&quot;</sf:DescripcionOperacion>"
        ));
        assert!(!xml.contains("<5mm>"));
    }

    #[test]
    fn money_renders_with_two_decimals() {
        let xml = registro_xml(&Registro::Alta(alta()));
        assert!(xml.contains("<sf:CuotaTotal>21.00</sf:CuotaTotal>"));
        assert!(xml.contains("<sf:ImporteTotal>121.00</sf:ImporteTotal>"));
        assert!(xml.contains("<sf:TipoImpositivo>21.00</sf:TipoImpositivo>"));
        assert!(xml.contains(
            "<sf:BaseImponibleOImporteNoSujeto>100.00</sf:BaseImponibleOImporteNoSujeto>"
        ));
    }

    #[test]
    fn first_record_emits_marker_instead_of_chain_link() {
        let xml = registro_xml(&Registro::Alta(alta()));
        assert!(xml.contains("<sf:PrimerRegistro>S</sf:PrimerRegistro>"));
        assert!(!xml.contains("<sf:RegistroAnterior>"));
    }

    #[test]
    fn chain_link_emits_previous_record_block() {
        let mut registro = alta();
        registro.previous = Some(ChainLink {
            issuer_nif: "B12345678".into(),
            serial: "A-0041".into(),
            issue_date: "14-03-2025".into(),
            huella: "cafe".into(),
        });
        let xml = registro_xml(&Registro::Alta(registro));
        assert!(xml.contains("<sf:RegistroAnterior>"));
        assert!(xml.contains("<sf:Huella>cafe</sf:Huella>"));
        assert!(!xml.contains("PrimerRegistro"));
    }

    #[test]
    fn recipient_variants_render_nif_or_id_otro() {
        let mut registro = alta();
        registro.recipient = Some(Recipient::Nif {
            nif: "A87654321".into(),
            name: "Cliente & Hijos".into(),
        });
        let xml = registro_xml(&Registro::Alta(registro));
        assert!(xml.contains("<sf:Destinatarios>"));
        assert!(xml.contains("<sf:NIF>A87654321</sf:NIF>"));
        assert!(xml.contains("<sf:NombreRazon>Cliente &amp; Hijos</sf:NombreRazon>"));

        let mut registro = alta();
        registro.recipient = Some(Recipient::Foreign {
            country: "DE".into(),
            id_type: "02".into(),
            id: "DE129273398".into(),
            name: "Fremde GmbH".into(),
        });
        let xml = registro_xml(&Registro::Alta(registro));
        assert!(xml.contains("<sf:IDOtro>"));
        assert!(xml.contains("<sf:CodigoPais>DE</sf:CodigoPais>"));
        assert!(xml.contains("<sf:IDType>02</sf:IDType>"));
    }

    #[test]
    fn suministro_wraps_registros_with_cabecera() {
        let cabecera = Cabecera {
            issuer_nif: "B12345678".into(),
            issuer_name: "Acme SL".into(),
            sistema: sistema(),
            technical_incident: false,
            requirement_ref: None,
        };
        let xml = suministro_xml(&cabecera, &[Registro::Alta(alta())]);
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(&format!(
            "<sf:RegFactuSistemaFacturacion xmlns:sf=\"{VERIFACTU_NS}\">"
        )));
        assert!(xml.contains("<sf:Cabecera>"));
        assert!(xml.contains("<sf:ObligadoEmision>"));
        assert!(xml.contains("<sf:RegistroFactura>"));
        assert!(xml.contains("<sf:TipoUsoPosibleSoloVerifactu>S</sf:TipoUsoPosibleSoloVerifactu>"));
        assert!(!xml.contains("IndicadorIncidenciaTecnica"));
        assert!(xml.ends_with("</sf:RegFactuSistemaFacturacion>"));
    }

    #[test]
    fn technical_incident_flag_is_emitted_when_set() {
        let cabecera = Cabecera {
            issuer_nif: "B12345678".into(),
            issuer_name: "Acme SL".into(),
            sistema: sistema(),
            technical_incident: true,
            requirement_ref: None,
        };
        let xml = suministro_xml(&cabecera, &[]);
        assert!(xml.contains(
            "<sf:IndicadorIncidenciaTecnica>S</sf:IndicadorIncidenciaTecnica>"
        ));
    }

    #[test]
    fn anulacion_renders_generator_and_version() {
        let registro = RegistroAnulacion {
            invoice_id: InvoiceId {
                issuer_nif: "B12345678".into(),
                serial: "A-0042".into(),
                issue_date: "15-03-2025".into(),
            },
            external_ref: None,
            generated_by: "E".into(),
            previous: None,
            sistema: sistema(),
            generated_at: "2025-03-16T10:00:00+01:00".into(),
            huella: "deadbeef".into(),
        };
        let xml = registro_xml(&Registro::Anulacion(registro));
        assert!(xml.contains("<sf:RegistroAnulacion"));
        assert!(xml.contains("<sf:GeneradoPor>E</sf:GeneradoPor>"));
        assert!(xml.contains("<sf:TipoHuella>01</sf:TipoHuella>"));
        assert!(xml.contains("<sf:IDVersion>1.0</sf:IDVersion>"));
        assert!(!xml.contains("RefExterna"));
    }
}
