mod address;
mod auth;
mod device_info;
mod envelope;
mod error;
mod request;
mod response;
mod retry;
mod rendezvous;
mod rng;
mod pubkey;
mod secret;
mod session;

pub use address::{Address, AddressParseError, DeviceName, DeviceNameError};
pub use auth::AuthPayload;
pub use device_info::DeviceInfo;
pub use envelope::{canonical_json, Envelope, HashingAlgo, SigningAlgo};
pub use error::ConfigError;
pub use request::{RvdRequest, SessionMode, SessionRequest};
pub use response::{ResponsePayload, ResponseStatus};
pub use retry::{retry_with_backoff, RetryConfig, TransientError};
pub use rendezvous::{RendezvousAllocation, RendezvousParseError};
pub use rng::get_crypto_rng;
pub use pubkey::PublicKeyRecord;
pub use secret::Secret;
pub use session::SessionId;
