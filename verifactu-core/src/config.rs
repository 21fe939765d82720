//! Environment selection and AEAT endpoint routing.
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// AEAT environment selection for web-service endpoints.
/// - Pre: the "preproducción" test environment.
/// - Production: the live environment.
///
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use verifactu_core::config::Environment;
///
/// let env = Environment::from_str("pre")?;
/// assert_eq!(env, Environment::Pre);
/// # Ok::<(), verifactu_core::config::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Pre,
    #[serde(alias = "production")]
    Prod,
}

/// Error returned when parsing an [`Environment`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid environment: {input}")]
    Invalid { input: String },
}

impl FromStr for Environment {
    type Err = EnvironmentParseError;
    fn from_str(env: &str) -> Result<Environment, EnvironmentParseError> {
        match env.to_ascii_lowercase().as_str() {
            "pre" => Ok(Environment::Pre),
            "prod" | "production" => Ok(Environment::Prod),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

/// Operation selector for the registration web service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// New invoice registration (alta).
    Registration,
    /// Cancellation of a previously reported invoice (anulación).
    Cancellation,
    /// Query of previously submitted records.
    Query,
}

impl Operation {
    /// SOAPAction header value mandated for this operation.
    pub fn soap_action(&self) -> &'static str {
        match self {
            Operation::Registration => "SuministroLR",
            Operation::Cancellation => "AnulacionLR",
            Operation::Query => "ConsultaLR",
        }
    }
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Pre => "pre",
            Environment::Prod => "prod",
        }
    }

    /// Fixed endpoint per (environment, operation) pair.
    ///
    /// Registration and cancellation go through the VERIFACTU supply
    /// endpoint; queries use the consultation service.
    pub fn endpoint_url(&self, operation: Operation) -> &'static str {
        match (self, operation) {
            (Environment::Pre, Operation::Registration | Operation::Cancellation) => {
                "https://prewww1.aeat.es/wlpl/VERIFACTU-FACT/ws/SuministroLR"
            }
            (Environment::Pre, Operation::Query) => {
                "https://prewww1.aeat.es/wlpl/SSII-FACT/ws/fe/SiiFactFEV2SOAP"
            }
            (Environment::Prod, Operation::Registration | Operation::Cancellation) => {
                "https://www1.agenciatributaria.gob.es/wlpl/VERIFACTU-FACT/ws/SuministroLR"
            }
            (Environment::Prod, Operation::Query) => {
                "https://www1.agenciatributaria.gob.es/wlpl/SSII-FACT/ws/fe/SiiFactFEV2SOAP"
            }
        }
    }
}
