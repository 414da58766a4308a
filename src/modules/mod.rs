//! Modules layer - Adapters for the external systems the bridge talks to
//!
//! Contains the message transport (MQTT) and the persistence sink (PostgreSQL).

pub mod mqtt;
pub mod sink;
