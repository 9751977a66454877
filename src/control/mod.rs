//! Control plane: range announcements and truncations over HTTP,
//! decoupled from the OTLP data plane.

pub mod client;
pub mod server;
pub mod types;

pub use client::{ControlClient, CONTROL_CHANNEL_CAPACITY};
pub use server::{ControlServer, ControlServerHandle};
pub use types::{Control, ControlKind, RangeAnnouncement};
