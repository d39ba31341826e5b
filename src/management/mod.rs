//! Management surface.
//!
//! Explicit consume / quota / reset operations for operators and tests,
//! independent of any request pipeline. Requests and responses are JSON
//! objects, one per line.

mod protocol;
mod server;
mod service;

pub use protocol::{ManagementRequest, ManagementResponse, PolicyRef};
pub use server::ManagementServer;
pub use service::ManagementService;
