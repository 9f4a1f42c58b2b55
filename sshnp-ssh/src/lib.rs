mod authorized_keys;
mod driver;
mod error;
mod identity;
mod keys;
mod signing;

pub use authorized_keys::{render_restriction, AuthorizedKeyEntry, AuthorizedKeySet};
pub use driver::{bridge_to_local_sshd, EmbeddedSshDriver, ExecSshDriver, SshDriver};
pub use error::{AuthError, SigningError};
pub use identity::load_or_generate_signing_key;
pub use keys::{
    generate_ephemeral_keypair, load_keypair_from_file, validate_ssh_public_key_prefix,
    EphemeralKeyPair, SshKeyAlgo, SUPPORTED_SSH_KEY_PREFIXES,
};
pub use signing::{sign_envelope, verify_envelope, LongTermSigningKey};
