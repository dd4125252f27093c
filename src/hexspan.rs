//! Big-endian hex renderings of `u32` word spans.
//!
//! The session-reset protocol exchanges fixed-width integers as left-padded
//! big-endian hex: the 32-byte challenge, the 4-word PRNG initialization
//! vector, and the 64-character halves of a P-256 signature. These helpers
//! keep that contract in one place.

use std::fmt::Write;

/// Render a span of words as lowercase hex, 8 characters per word, most
/// significant word first.
pub fn words_to_hex(words: &[u32]) -> String {
    let mut out = String::with_capacity(words.len() * 8);
    for w in words {
        let _ = write!(out, "{w:08x}");
    }
    out
}

/// Parse `out.len() * 8` hex characters into big-endian words.
pub fn words_from_hex(input: &str, out: &mut [u32]) -> Result<(), String> {
    if !input.is_ascii() {
        return Err("non-ASCII input".to_string());
    }
    if input.len() != out.len() * 8 {
        return Err(format!(
            "expected {} hex chars, got {}",
            out.len() * 8,
            input.len()
        ));
    }
    for (i, slot) in out.iter_mut().enumerate() {
        let segment = &input[i * 8..(i + 1) * 8];
        *slot = u32::from_str_radix(segment, 16).map_err(|e| format!("bad hex word: {e}"))?;
    }
    Ok(())
}

/// Decode exactly 64 hex characters into 32 big-endian bytes.
pub fn bytes32_from_hex(input: &str) -> Result<[u8; 32], String> {
    if input.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", input.len()));
    }
    let decoded = hex::decode(input).map_err(|e| format!("bad hex: {e}"))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&decoded);
    Ok(out)
}
