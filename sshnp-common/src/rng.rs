use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// A CSPRNG seeded from the OS entropy source, grounded in
/// `warpgate-common::helpers::rng::get_crypto_rng`.
pub fn get_crypto_rng() -> ChaCha20Rng {
    ChaCha20Rng::from_entropy()
}
