//! Host networking: bridge + NAT plumbing, TAP devices, and the per-task
//! network manager.

pub mod bridge;
pub mod manager;
pub mod tap;

pub use manager::{BridgeNetworkManager, NetworkManager};
pub use tap::TapRecord;

use thiserror::Error;

/// Errors from host networking operations.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("host tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("permission denied running {command}")]
    PermissionDenied { command: String },

    #[error("bridge create failed: {0}")]
    BridgeCreateFailed(String),

    #[error("TAP create failed: {0}")]
    TapCreateFailed(String),

    #[error("TAP attach failed: {0}")]
    TapAttachFailed(String),

    #[error("host command failed: {0}")]
    CommandFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Pool(#[from] scorch_networking::NetworkError),

    #[error("invalid static address {0:?}")]
    InvalidStaticAddress(String),

    #[error("network preparation cancelled")]
    Cancelled,

    #[error("network cleanup finished with errors: {}", errors.join("; "))]
    CleanupPartial { errors: Vec<String> },
}

/// Deterministic TAP device name for a task's N-th attachment.
///
/// `tap-<h4>-eth<N>`: four hex chars of the stable task hash keep names
/// unique across tasks while staying under IFNAMSIZ (15 chars) and keeping
/// the guest-side `ethN` correspondence visible.
pub fn tap_device_name(task_id: &str, index: usize) -> String {
    let scope = scorch_networking::stable_hash(task_id) & 0xffff;
    format!("tap-{scope:04x}-eth{index}")
}
