//! Protocol Stack Layers Library
//!
//! This crate implements the 5G NR gNB MAC scheduler core (3GPP TS 38.321).

pub mod mac;

use interfaces::InterfaceError;
use thiserror::Error;

pub use mac::MacError;

/// Common errors for protocol layers
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("MAC error: {0}")]
    Mac(#[from] MacError),

    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),
}
