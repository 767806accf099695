//! Mowfleet backend library.
//!
//! Device-facing protocol engine for a fleet of remotely operated
//! lawnmowers: framed binary wire protocol, DH-based mutual
//! authentication, per-connection sessions, and the outbound action
//! dispatcher used by the operator surface.

pub mod crypto;
pub mod dispatch;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod telemetry;
