//! Policy resolution
//!
//! Turns a listener's flat [`Options`] into an immutable [`PolicySnapshot`]
//! shared by every connection accepted under it.

mod options;
mod snapshot;

pub use options::Options;
pub use snapshot::{
    resolve_read_timeout, resolve_udp_buffer_size, PolicySnapshot, DEFAULT_READ_TIMEOUT,
    DEFAULT_UDP_BUFFER_SIZE, MAX_UDP_BUFFER_SIZE, MIN_UDP_BUFFER_SIZE,
};

use crate::mitm::MaterialError;
use thiserror::Error;

/// Policy resolution errors; fatal to the policy, not to the process
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A value could not be interpreted
    #[error("invalid option {key}: {reason}")]
    Configuration { key: String, reason: String },

    /// Only one of the CA certificate / key paths was given
    #[error("MITM material incomplete: {present} is set but {missing} is not")]
    MitmMaterialIncomplete {
        present: &'static str,
        missing: &'static str,
    },

    /// CA material could not be loaded
    #[error("MITM material invalid: {0}")]
    MitmMaterialInvalid(#[source] MaterialError),
}

impl PolicyError {
    pub(crate) fn configuration(key: &str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Option key blamed by a configuration error
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Configuration { key, .. } => Some(key),
            Self::MitmMaterialIncomplete { missing, .. } => Some(missing),
            Self::MitmMaterialInvalid(_) => None,
        }
    }
}
