//! Local VM state persistence.

mod store;

pub use store::{default_state_path, StateStore, StoreError, VmInstance, VmState};
