//! MAC Collaborator Interfaces Library
//! 
//! This crate defines the messages exchanged between the MAC scheduler and its
//! collaborators: the PHY interface module (slot and uplink indications) and the
//! northbound telemetry/control agent.

pub mod message_types;
pub mod northbound;

pub use message_types::*;
pub use northbound::*;

use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
