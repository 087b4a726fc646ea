#![doc = include_str!("../README.md")]

pub mod callback;
pub mod config;
pub mod error;
pub mod passid;
pub mod provider;
pub mod reconciler;
pub mod storage;
pub mod types;
pub mod verify;

// Re-exports for convenient access
pub use callback::CallbackParams;
pub use config::GateConfig;
pub use error::{Error, MigrationStage};
pub use passid::PassId;
pub use provider::AuthProvider;
pub use reconciler::{CallbackOutcome, GateState, IdentityGate};
pub use storage::{BoxError, FileTokenStore, MemoryTokenStore, TokenStore};
pub use types::{AuthEvent, CustomerProfile, Session};
pub use verify::{HttpVerifier, IdentityVerifier, VerifyOutcome};
