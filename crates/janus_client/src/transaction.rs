use rand::{Rng, rng};

/// Length of every generated transaction token.
pub const TRANSACTION_LEN: usize = 12;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Produce a random correlation token made of ASCII letters.
///
/// Only used to pair requests with their asynchronous events, so the
/// thread-local RNG is plenty.
pub fn transaction_id() -> String {
    let mut rng = rng();
    (0..TRANSACTION_LEN)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}
