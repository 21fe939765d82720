//! XAdES enveloped signature construction (ETSI EN 319 132), required by
//! Artículo 14 of Orden HAC/1177/2024.
use base64ct::{Base64, Encoding};
use chrono::{SecondsFormat, Utc};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer as _};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use std::time::SystemTime;
use thiserror::Error;
use x509_cert::der::{DecodePem, Encode};
use x509_cert::Certificate;

const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
const XADES_NS: &str = "http://uri.etsi.org/01903/v1.3.2#";

const C14N_ALGORITHM: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
const RSA_SHA256_ALGORITHM: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
const SHA256_ALGORITHM: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const ENVELOPED_TRANSFORM: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

const SIGNATURE_ID: &str = "Signature-verifactu";
const SIGNED_PROPERTIES_ID: &str = "SignedProperties-verifactu";
const KEY_INFO_ID: &str = "KeyInfo-verifactu";
const SIGNATURE_VALUE_ID: &str = "SignatureValue-verifactu";

/// Errors raised while building a signature. Each failure mode is distinct;
/// none falls back silently.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("certificate parse error: {0}")]
    CertificateParse(String),
    #[error("private key parse error: {0}")]
    KeyParse(String),
    #[error("certificate has expired")]
    CertificateExpired,
    #[error("certificate is not yet valid")]
    CertificateNotYetValid,
    #[error("could not find closing tag in XML")]
    MissingClosingTag,
    #[error("signing error: {0}")]
    Signing(String),
}

/// Enveloped-signature builder bound to one certificate and private key.
///
/// The certificate is parsed for real (issuer, serial, validity window); an
/// expired or not-yet-valid certificate is rejected at construction time.
#[derive(Debug)]
pub struct XadesSigner {
    certificate: Certificate,
    cert_der: Vec<u8>,
    signing_key: SigningKey<Sha256>,
}

impl XadesSigner {
    /// Build a signer from PEM-encoded certificate and private key. The key
    /// may be unencrypted PKCS#8/PKCS#1 or password-protected PKCS#8.
    ///
    /// # Errors
    /// [`SigningError::CertificateParse`], [`SigningError::KeyParse`],
    /// [`SigningError::CertificateExpired`] or
    /// [`SigningError::CertificateNotYetValid`].
    pub fn from_pem(
        cert_pem: &str,
        key_pem: &str,
        key_password: Option<&str>,
    ) -> Result<Self, SigningError> {
        let certificate = Certificate::from_pem(cert_pem.as_bytes())
            .map_err(|e| SigningError::CertificateParse(format!("{e:?}")))?;
        let cert_der = certificate
            .to_der()
            .map_err(|e| SigningError::CertificateParse(format!("{e:?}")))?;
        check_validity(&certificate)?;

        let private_key = match key_password {
            Some(password) => RsaPrivateKey::from_pkcs8_encrypted_pem(key_pem, password.as_bytes())
                .map_err(|e| SigningError::KeyParse(format!("{e:?}")))?,
            None => RsaPrivateKey::from_pkcs8_pem(key_pem)
                .or_else(|_| RsaPrivateKey::from_pkcs1_pem(key_pem))
                .map_err(|e| SigningError::KeyParse(format!("{e:?}")))?,
        };

        Ok(Self {
            certificate,
            cert_der,
            signing_key: SigningKey::<Sha256>::new(private_key),
        })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Issuer distinguished name, comma-normalized.
    pub fn issuer(&self) -> String {
        let issuer = self.certificate.tbs_certificate.issuer.to_string();
        issuer
            .split(',')
            .map(str::trim)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Certificate serial number as a decimal string.
    pub fn serial(&self) -> String {
        serial_bytes_to_decimal_string(self.certificate.tbs_certificate.serial_number.as_bytes())
    }

    /// Canonicalize the document, digest it, build the XAdES qualifying
    /// properties, sign the SignedInfo with RSA-SHA256 and splice the
    /// complete `ds:Signature` element immediately before the closing tag of
    /// the root element.
    ///
    /// # Errors
    /// [`SigningError::MissingClosingTag`] for malformed input,
    /// [`SigningError::Signing`] for signature failures.
    pub fn sign_enveloped(&self, xml: &str) -> Result<String, SigningError> {
        let canonical = canonicalize(xml);
        let document_digest = sha256_base64(canonical.as_bytes());

        let signing_time = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let cert_digest = sha256_base64(&self.cert_der);
        let signed_properties = signed_properties_xml(
            &cert_digest,
            &self.issuer(),
            &self.serial(),
            &signing_time,
        );
        let properties_digest = sha256_base64(canonicalize(&signed_properties).as_bytes());

        let signed_info = signed_info_xml(&document_digest, &properties_digest);
        let signature_value = self.sign_bytes(canonicalize(&signed_info).as_bytes())?;

        let certificate_b64 = Base64::encode_string(&self.cert_der);
        let signature = format!(
            "<ds:Signature xmlns:ds=\"{DS_NS}\" Id=\"{SIGNATURE_ID}\">\n  {signed_info}\n  \
             <ds:SignatureValue Id=\"{SIGNATURE_VALUE_ID}\">{signature_value}</ds:SignatureValue>\n  \
             <ds:KeyInfo Id=\"{KEY_INFO_ID}\">\n    <ds:X509Data>\n      \
             <ds:X509Certificate>{certificate_b64}</ds:X509Certificate>\n    </ds:X509Data>\n  \
             </ds:KeyInfo>\n  <ds:Object>\n    \
             <xades:QualifyingProperties xmlns:xades=\"{XADES_NS}\" Target=\"#{SIGNATURE_ID}\">\n      \
             {signed_properties}\n    </xades:QualifyingProperties>\n  </ds:Object>\n</ds:Signature>"
        );

        splice_before_closing_tag(xml, &signature)
    }

    fn sign_bytes(&self, data: &[u8]) -> Result<String, SigningError> {
        let signature = self
            .signing_key
            .try_sign(data)
            .map_err(|e| SigningError::Signing(e.to_string()))?;
        Ok(Base64::encode_string(&signature.to_vec()))
    }
}

/// Check a certificate's validity window without constructing a signer.
///
/// # Errors
/// Same certificate errors as [`XadesSigner::from_pem`].
pub fn validate_certificate(cert_pem: &str) -> Result<(), SigningError> {
    let certificate = Certificate::from_pem(cert_pem.as_bytes())
        .map_err(|e| SigningError::CertificateParse(format!("{e:?}")))?;
    check_validity(&certificate)
}

fn check_validity(certificate: &Certificate) -> Result<(), SigningError> {
    let validity = &certificate.tbs_certificate.validity;
    let now = SystemTime::now();
    if validity.not_after.to_system_time() < now {
        return Err(SigningError::CertificateExpired);
    }
    if validity.not_before.to_system_time() > now {
        return Err(SigningError::CertificateNotYetValid);
    }
    Ok(())
}

/// Canonicalization applied before every digest: normalized line endings,
/// surrounding whitespace trimmed.
fn canonicalize(xml: &str) -> String {
    xml.replace("\r\n", "\n").replace('\r', "\n").trim().to_string()
}

fn sha256_base64(data: &[u8]) -> String {
    Base64::encode_string(&Sha256::digest(data))
}

fn serial_bytes_to_decimal_string(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "0".to_string();
    }

    let mut digits: Vec<u8> = vec![0];
    for &byte in bytes {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            let value = (*digit as u32) * 256 + carry;
            *digit = (value % 10) as u8;
            carry = value / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }

    while digits.len() > 1 && matches!(digits.last(), Some(0)) {
        digits.pop();
    }

    digits.iter().rev().map(|d| (b'0' + *d) as char).collect()
}

fn signed_info_xml(document_digest: &str, properties_digest: &str) -> String {
    format!(
        "<ds:SignedInfo xmlns:ds=\"{DS_NS}\">\n  \
         <ds:CanonicalizationMethod Algorithm=\"{C14N_ALGORITHM}\"/>\n  \
         <ds:SignatureMethod Algorithm=\"{RSA_SHA256_ALGORITHM}\"/>\n  \
         <ds:Reference URI=\"\">\n    <ds:Transforms>\n      \
         <ds:Transform Algorithm=\"{ENVELOPED_TRANSFORM}\"/>\n      \
         <ds:Transform Algorithm=\"{C14N_ALGORITHM}\"/>\n    </ds:Transforms>\n    \
         <ds:DigestMethod Algorithm=\"{SHA256_ALGORITHM}\"/>\n    \
         <ds:DigestValue>{document_digest}</ds:DigestValue>\n  </ds:Reference>\n  \
         <ds:Reference URI=\"#{SIGNED_PROPERTIES_ID}\" Type=\"http://uri.etsi.org/01903#SignedProperties\">\n    \
         <ds:DigestMethod Algorithm=\"{SHA256_ALGORITHM}\"/>\n    \
         <ds:DigestValue>{properties_digest}</ds:DigestValue>\n  </ds:Reference>\n</ds:SignedInfo>"
    )
}

fn signed_properties_xml(
    cert_digest: &str,
    issuer_name: &str,
    serial_number: &str,
    signing_time: &str,
) -> String {
    format!(
        "<xades:SignedProperties xmlns:xades=\"{XADES_NS}\" Id=\"{SIGNED_PROPERTIES_ID}\">\n  \
         <xades:SignedSignatureProperties>\n    \
         <xades:SigningTime>{signing_time}</xades:SigningTime>\n    \
         <xades:SigningCertificateV2>\n      <xades:Cert>\n        <xades:CertDigest>\n          \
         <ds:DigestMethod xmlns:ds=\"{DS_NS}\" Algorithm=\"{SHA256_ALGORITHM}\"/>\n          \
         <ds:DigestValue xmlns:ds=\"{DS_NS}\">{cert_digest}</ds:DigestValue>\n        \
         </xades:CertDigest>\n        <xades:IssuerSerial>\n          \
         <ds:X509IssuerName xmlns:ds=\"{DS_NS}\">{issuer_name}</ds:X509IssuerName>\n          \
         <ds:X509SerialNumber xmlns:ds=\"{DS_NS}\">{serial_number}</ds:X509SerialNumber>\n        \
         </xades:IssuerSerial>\n      </xades:Cert>\n    </xades:SigningCertificateV2>\n  \
         </xades:SignedSignatureProperties>\n  <xades:SignedDataObjectProperties>\n    \
         <xades:DataObjectFormat ObjectReference=\"#xmldsig-ref0\">\n      \
         <xades:MimeType>text/xml</xades:MimeType>\n    </xades:DataObjectFormat>\n  \
         </xades:SignedDataObjectProperties>\n</xades:SignedProperties>"
    )
}

fn splice_before_closing_tag(xml: &str, signature: &str) -> Result<String, SigningError> {
    let trimmed = xml.trim_end();
    if !trimmed.ends_with('>') {
        return Err(SigningError::MissingClosingTag);
    }
    let insert_at = trimmed.rfind("</").ok_or(SigningError::MissingClosingTag)?;

    let mut signed = String::with_capacity(xml.len() + signature.len() + 1);
    signed.push_str(&xml[..insert_at]);
    signed.push_str(signature);
    signed.push('\n');
    signed.push_str(&xml[insert_at..]);
    Ok(signed)
}
