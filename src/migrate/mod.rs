//! Multi-step commands that move data: list element moves within a
//! database and key/slot migration to another node.

pub mod client;
pub mod mover;
pub mod slots;

pub use client::PeerClient;
pub use slots::{migrate, MigrateTarget, MigrateUnit};
