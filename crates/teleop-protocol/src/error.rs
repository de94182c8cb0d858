use thiserror::Error;

pub type Result<T, E = ValidationError> = core::result::Result<T, E>;

/// Why a wire message was rejected. Each variant names the offending key.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("missing key: {0}")]
    MissingKey(&'static str),
    #[error("type must be 'cmd', got {0}")]
    WrongType(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidField { key: &'static str, reason: String },
    #[error("seq must be >= 0, got {0}")]
    NegativeSeq(i64),
    #[error("confidence must be in [0,1], got {0}")]
    ConfidenceOutOfRange(f64),
    #[error("{0} must be an object")]
    NotAMapping(&'static str),
    #[error("invalid motor id: {0}")]
    InvalidMotorId(String),
    #[error("invalid goal position for motor {motor}")]
    InvalidJointValue { motor: String },
    #[error("invalid value for feature {name}")]
    InvalidFeature { name: String },
}

impl ValidationError {
    /// Top-level message key the error refers to, if any.
    pub fn key(&self) -> Option<&'static str> {
        match self {
            ValidationError::Malformed(_) | ValidationError::NotAnObject => None,
            ValidationError::MissingKey(k) => Some(*k),
            ValidationError::WrongType(_) => Some("type"),
            ValidationError::InvalidField { key, .. } => Some(*key),
            ValidationError::NegativeSeq(_) => Some("seq"),
            ValidationError::ConfidenceOutOfRange(_) => Some("confidence"),
            ValidationError::NotAMapping(k) => Some(*k),
            ValidationError::InvalidMotorId(_) | ValidationError::InvalidJointValue { .. } => {
                Some("joints")
            }
            ValidationError::InvalidFeature { .. } => Some("features"),
        }
    }
}
