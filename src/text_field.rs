//! Serde form of fixed-width, NUL-padded byte fields (entry names, version
//! strings).
//!
//! Printable ASCII travels as a plain JSON string.  Anything else, including
//! embedded NULs, travels as `{"hex": "..."}` so the sidecar reproduces every
//! byte.  Trailing NUL padding is never serialized.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub(crate) fn trim_nul(raw: &[u8]) -> &[u8] {
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &raw[..end]
}

/// The field as text, if every byte before the padding is printable ASCII.
pub(crate) fn printable(raw: &[u8]) -> Option<&str> {
    let raw = trim_nul(raw);
    if raw.iter().all(|b| (0x20..0x7F).contains(b)) {
        std::str::from_utf8(raw).ok()
    } else {
        None
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Repr {
    Text(String),
    Hex { hex: String },
}

pub(crate) fn serialize<S: Serializer>(raw: &[u8], s: S) -> Result<S::Ok, S::Error> {
    match printable(raw) {
        Some(text) => Repr::Text(text.to_owned()).serialize(s),
        None       => Repr::Hex { hex: hex::encode(trim_nul(raw)) }.serialize(s),
    }
}

/// At most `width` bytes, trailing NULs removed.
pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D, width: usize) -> Result<Vec<u8>, D::Error> {
    let bytes = match Repr::deserialize(d)? {
        Repr::Text(text)  => text.into_bytes(),
        Repr::Hex { hex } => hex::decode(&hex).map_err(D::Error::custom)?,
    };
    let bytes = trim_nul(&bytes).to_vec();
    if bytes.len() > width {
        return Err(D::Error::custom(format!("field holds {} bytes, at most {width} fit", bytes.len())));
    }
    Ok(bytes)
}
