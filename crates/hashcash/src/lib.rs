//! Hashcash proof-of-work admission
//!
//! Every overlay message carries a hashcash token binding the message payload
//! to a counter whose SHA3-512 digest starts with a claimed number of zero
//! bits. Verifiers require the claimed difficulty to be at least their
//! advertised price, and the claim itself must be exact: a token minted at
//! 12 bits does not verify as an 8-bit token.
//!
//! Token layout (seven colon-separated fields):
//!
//! ```text
//! 1:<bits>:<timestamp>::<payload-hex>:<salt>:<counter-b64>
//! ```

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use sha3::{Digest, Sha3_512};
use thiserror::Error;

/// Number of hex characters in a token salt.
pub const SALT_LENGTH: usize = 64;

/// Hard cap on the difficulty any pricing function may ask for.
pub const MAX_DIFFICULTY: u64 = 32;

/// How many counters the mint loop tries between cancellation checks.
const MINT_CHECK_INTERVAL: u128 = 512;

#[derive(Error, Debug)]
pub enum HashcashError {
    #[error("invalid hashcash: expected 7 fields, got {0}")]
    BadFormat(usize),

    #[error("failed to parse bits field: {0}")]
    BadBits(#[from] std::num::ParseIntError),

    #[error("token payload does not match message payload")]
    PayloadMismatch,

    #[error("expecting difficulty {required} but token claims {claimed}")]
    InsufficientDifficulty { required: u64, claimed: u64 },

    #[error("expecting {claimed} leading zero bits but hash has {actual}")]
    BitsMismatch { claimed: u64, actual: u64 },

    #[error("search canceled by deadline")]
    Canceled,
}

/// Count the leading zero bits of a byte string.
pub fn count_leading_zero_bits(bytes: &[u8]) -> u64 {
    let mut n = 0u64;
    for &b in bytes {
        if b == 0 {
            n += 8;
        } else {
            n += u64::from(b.leading_zeros());
            break;
        }
    }
    n
}

/// Per-connection admission price as a function of active connections.
///
/// Logarithmic growth keeps the price affordable for well-behaved clients
/// while still rising monotonically under load. The result never exceeds
/// [`MAX_DIFFICULTY`].
pub fn log_difficulty(connections: i64) -> u64 {
    const GROWTH_FACTOR: f64 = 2.0;

    if connections <= 1 {
        return 0;
    }

    let x = (GROWTH_FACTOR * (connections as f64).ln()).floor();
    if x <= 0.0 {
        0
    } else {
        (x as u64).min(MAX_DIFFICULTY)
    }
}

fn sha3_512(token: &str) -> [u8; 64] {
    let mut hasher = Sha3_512::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

fn random_salt() -> String {
    let mut bytes = [0u8; SALT_LENGTH / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Minimal big-endian representation of the counter. Zero encodes as the
/// empty string, mirroring a big-integer byte dump.
fn counter_bytes(counter: u128) -> Vec<u8> {
    let bytes = counter.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

fn format_token(bits: u64, ts: u64, payload_hex: &str, salt: &str, counter: u128) -> String {
    format!(
        "1:{}:{}::{}:{}:{}",
        bits,
        ts,
        payload_hex,
        salt,
        BASE64.encode(counter_bytes(counter))
    )
}

/// Mint a token over `payload` whose digest has exactly `bits` leading zero
/// bits. The search yields to the runtime periodically and aborts with
/// [`HashcashError::Canceled`] once `deadline` has elapsed.
pub async fn mint(bits: u64, payload: &[u8], deadline: Duration) -> Result<String, HashcashError> {
    mint_with_salt(bits, payload, &random_salt(), deadline).await
}

/// Same as [`mint`] with a caller-provided salt.
pub async fn mint_with_salt(
    bits: u64,
    payload: &[u8],
    salt: &str,
    deadline: Duration,
) -> Result<String, HashcashError> {
    let payload_hex = hex::encode(payload);
    let ts = timestamp();
    let started = Instant::now();

    let mut counter: u128 = 0;
    loop {
        if counter % MINT_CHECK_INTERVAL == 0 && counter > 0 {
            if started.elapsed() >= deadline {
                return Err(HashcashError::Canceled);
            }
            tokio::task::yield_now().await;
        }

        let token = format_token(bits, ts, &payload_hex, salt, counter);
        if count_leading_zero_bits(&sha3_512(&token)) == bits {
            return Ok(token);
        }
        counter += 1;
    }
}

/// Verify a token in isolation: well-formed and digest matching the claim.
pub fn verify(token: &str) -> Result<(), HashcashError> {
    let parts: Vec<&str> = token.split(':').collect();
    if parts.len() != 7 {
        return Err(HashcashError::BadFormat(parts.len()));
    }

    let claimed: u64 = parts[1].parse()?;
    check_bits(token, claimed)
}

/// Verify a token against the receiver's advertised difficulty and the
/// receiver's own re-serialization of the message payload.
pub fn verify_with_difficulty_and_payload(
    token: &str,
    required: u64,
    payload: &[u8],
) -> Result<(), HashcashError> {
    let parts: Vec<&str> = token.split(':').collect();
    if parts.len() != 7 {
        return Err(HashcashError::BadFormat(parts.len()));
    }

    if parts[4] != hex::encode(payload) {
        return Err(HashcashError::PayloadMismatch);
    }

    let claimed: u64 = parts[1].parse()?;
    if claimed < required {
        return Err(HashcashError::InsufficientDifficulty { required, claimed });
    }

    check_bits(token, claimed)
}

fn check_bits(token: &str, claimed: u64) -> Result<(), HashcashError> {
    let actual = count_leading_zero_bits(&sha3_512(token));
    if actual != claimed {
        return Err(HashcashError::BitsMismatch { claimed, actual });
    }
    Ok(())
}
