//! Error taxonomy for the swap-chain core.
//!
//! Library entry points return [`Result`] with a [`SwapchainError`]. Binaries
//! wrap these in `anyhow` with context, the same way configuration errors are
//! reported.

use crate::lock::LockUsage;
use crate::memory::BufferName;

/// All errors produced by the swap-chain core.
///
/// Variants fall into the classes the surface manager reports to its caller:
/// - **Recoverable allocation**: `AllocationFailure`
/// - **Native refusal**: `PlatformRejection`
/// - **Best-effort arbitration**: `TransientLockTimeout`
/// - **API misuse**: `AccessDenied`, `BadAttribute`, `BadSurface`, `BadNativeTarget`
#[derive(thiserror::Error, Debug)]
pub enum SwapchainError {
    #[error("allocation failed: {0}")]
    AllocationFailure(String),

    #[error("native window system rejected request: {0}")]
    PlatformRejection(String),

    #[error("lock on buffer {name} ({usage:?}) not granted after {attempts} attempts")]
    TransientLockTimeout {
        name: BufferName,
        usage: LockUsage,
        attempts: u32,
    },

    #[error("access denied: {0}")]
    AccessDenied(&'static str),

    #[error("bad attribute: {0}")]
    BadAttribute(String),

    #[error("unknown surface {0}")]
    BadSurface(u64),

    #[error("native target does not match surface: {0}")]
    BadNativeTarget(String),

    #[error("invalid configuration: {0}")]
    BadConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SwapchainError>;

impl SwapchainError {
    /// Errors a caller is expected to retry: allocation failures (with a
    /// smaller buffer count or a blit fallback) and lock timeouts.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SwapchainError::AllocationFailure(_) | SwapchainError::TransientLockTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SwapchainError::TransientLockTimeout {
            name: BufferName(7),
            usage: LockUsage::CpuWrite,
            attempts: 6,
        };
        assert_eq!(
            err.to_string(),
            "lock on buffer 7 (CpuWrite) not granted after 6 attempts"
        );
        assert!(err.is_recoverable());

        let err = SwapchainError::AccessDenied("surface is not locked");
        assert_eq!(err.to_string(), "access denied: surface is not locked");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no device");
        let err: SwapchainError = io.into();
        assert!(matches!(err, SwapchainError::Io(_)));
    }
}
