use thiserror::Error;

pub type Result<T, E = BusError> = core::result::Result<T, E>;

/// Transport-level outcome of a bus transaction that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommResult {
    #[error("port is not open")]
    PortClosed,
    #[error("failed to transmit packet: {0}")]
    TxFail(String),
    #[error("failed to read from port: {0}")]
    RxFail(String),
    #[error("no status packet before timeout")]
    RxTimeout,
    #[error("corrupt status packet: {0}")]
    RxCorrupt(&'static str),
    #[error("status from id {got}, expected {expected}")]
    IdMismatch { expected: u8, got: u8 },
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to open {device}: {reason}")]
    Open { device: String, reason: String },
    /// The bus transaction itself failed (nothing or garbage came back).
    #[error("comm error (id {id:?}): {result}")]
    Comm { id: Option<u8>, result: CommResult },
    /// A servo answered but flagged an error in its status packet.
    #[error("device {id} reported error 0x{code:02X}")]
    Device { id: u8, code: u8 },
    #[error("serial i/o: {0}")]
    Io(String),
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl BusError {
    pub fn comm(id: Option<u8>, result: CommResult) -> Self {
        BusError::Comm { id, result }
    }

    pub fn is_comm(&self) -> bool {
        matches!(self, BusError::Comm { .. })
    }
}

/// A bulk torque write stopped part way through the id list.
#[derive(Debug, Error)]
#[error("torque write failed at id {failed_id} after {} ok: {source}", applied.len())]
pub struct TorqueAllError {
    /// Ids that accepted the write before the failure, in bus order.
    pub applied: Vec<u8>,
    pub failed_id: u8,
    #[source]
    pub source: BusError,
}
