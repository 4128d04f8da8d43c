//! Tunnel identifier generation and validation
//!
//! Identifiers are short lowercase alphanumeric strings used both as the
//! public subdomain label and as the registry key. Generation makes no
//! uniqueness guarantee; callers must check the registry and re-roll on
//! collision.

use rand::Rng;

const ID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of generated identifiers
pub const GENERATED_LEN: usize = 4;

/// Generate a random identifier, uniform over the charset
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    (0..GENERATED_LEN)
        .map(|_| ID_CHARS[rng.gen_range(0..ID_CHARS.len())] as char)
        .collect()
}

/// Check a caller-requested identifier against the allowed charset `[a-z0-9]+`
pub fn validate(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}
