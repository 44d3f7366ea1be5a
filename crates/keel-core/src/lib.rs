//! keel core - step types, error taxonomy, configuration and credentials

pub mod config;
pub mod credentials;
pub mod error;
pub mod types;

pub use config::{BackoffConfig, CredentialConfig, KeelConfig, RunSettings, ShellConfig};
pub use credentials::CredentialContext;
pub use error::{Error, FailureClass, Result};
pub use types::*;
