//! Public Id Generation
//!
//! Ids are `{prefix}_{tsid}`: a resource-type prefix followed by a
//! 13-character Crockford Base32 time-sorted id.

use rand::Rng;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::shared::error::{PlatformError, Result};

/// Crockford Base32 alphabet (excludes I, L, O, U)
const ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const TSID_LEN: usize = 13;

static COUNTER: AtomicU16 = AtomicU16::new(0);

pub const PRINCIPAL_PREFIX: &str = "u";
pub const PASSWORD_ACCOUNT_PREFIX: &str = "acctpw";
pub const PASSWORD_AUTH_METHOD_PREFIX: &str = "ampw";
pub const ORG_PREFIX: &str = "o";
pub const PROJECT_PREFIX: &str = "p";

/// Generate a new public id with the given prefix.
pub fn new_public_id(prefix: &str) -> Result<String> {
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_lowercase()) {
        return Err(PlatformError::invalid_parameter(format!(
            "public id prefix {:?} must be lowercase ascii",
            prefix
        )));
    }
    Ok(format!("{}_{}", prefix, generate_tsid()))
}

/// 64-bit layout: 42 bits of unix millis, 10 random bits, 12 counter bits.
fn generate_tsid() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst) as u64;
    let random: u64 = rand::thread_rng().gen::<u16>() as u64 & 0x3FF;

    let tsid = ((now & 0x3FF_FFFF_FFFF) << 22) | (random << 12) | (counter & 0xFFF);
    encode_crockford(tsid)
}

fn encode_crockford(mut value: u64) -> String {
    let mut out = [b'0'; TSID_LEN];
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(value & 0x1F) as usize];
        value >>= 5;
    }
    out.iter().map(|&b| b as char).collect()
}
