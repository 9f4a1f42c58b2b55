//! Session orchestration shared by `np`, `npd` and `rvd`: the client-side
//! and daemon-side halves of spec.md §4, the rendezvous relay (§4.1),
//! discovery (§4.3 supplement) and the cleanup/config/error plumbing they
//! all sit on.

pub mod client;
pub mod cleanup;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod rendezvous;
pub mod topics;

pub use client::{SessionOrchestrator, SessionOutcome};
pub use cleanup::SessionGuard;
pub use config::{ClientConfig, DaemonConfig, RelayConfig, SshAlgoConfig, SshClientConfig};
pub use daemon::DaemonController;
pub use discovery::{discover_devices, DiscoveredDevice, DiscoveryReport};
pub use error::SessionError;
pub use rendezvous::{serve_rendezvous_requests, Relay, RelayError};
