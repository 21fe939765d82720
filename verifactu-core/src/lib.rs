//! Rust toolkit for VeriFactu invoice reporting (Orden HAC/1177/2024): record
//! transformation, chain hashing, XML generation, XAdES signing, and the AEAT
//! web-service client.
//!
//! # Examples
//! ```rust
//! use verifactu_core::config::{Environment, Operation};
//!
//! let env = Environment::Pre;
//! assert!(env.endpoint_url(Operation::Registration).starts_with("https://prewww1"));
//! ```
pub mod client;
pub mod config;
pub mod registro;
pub mod xades;

use thiserror::Error;

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] registro::ValidationError),
    #[error(transparent)]
    Date(#[from] registro::hash::DateError),
    #[error(transparent)]
    Signing(#[from] xades::SigningError),
    #[error(transparent)]
    Transport(#[from] client::TransportError),
    #[error(transparent)]
    Aeat(#[from] client::AeatError),
}

#[cfg(test)]
mod tests {
    use super::Error;
    use crate::client::{AeatError, TransportError};
    use crate::registro::hash::DateError;
    use crate::registro::{RecordField, ValidationError, ValidationIssue, ValidationKind};
    use crate::xades::SigningError;

    #[test]
    fn error_conversions_cover_variants() {
        let validation = ValidationError::new(vec![ValidationIssue {
            field: RecordField::InvoiceNumber,
            kind: ValidationKind::Missing,
        }]);
        let err: Error = validation.into();
        assert!(matches!(err, Error::Validation(_)));

        let err: Error = DateError::Unparseable("not a date".into()).into();
        assert!(matches!(err, Error::Date(_)));

        let err: Error = SigningError::MissingClosingTag.into();
        assert!(matches!(err, Error::Signing(_)));

        let err: Error = TransportError::Network("boom".into()).into();
        assert!(matches!(err, Error::Transport(_)));

        let err: Error = AeatError::Parse("no body".into()).into();
        assert!(matches!(err, Error::Aeat(_)));
    }
}
