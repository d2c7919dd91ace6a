use serde::{Deserialize, Serialize};

pub mod canonical;
pub mod job;

/// Bytes per gigabyte as used by quota accounting (binary gigabytes).
pub const BYTES_PER_GB: f64 = 1_073_741_824.0;

pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

pub fn gb_to_bytes(gb: f64) -> u64 {
    if !gb.is_finite() || gb <= 0.0 {
        return 0;
    }
    (gb * BYTES_PER_GB).round().min(u64::MAX as f64) as u64
}

/// Error envelope shared with the warehouse API so client libraries surface
/// proxy errors the same way they surface upstream ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }
}
