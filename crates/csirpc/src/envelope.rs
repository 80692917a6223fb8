//! Envelope encoding for one unary exchange.
//!
//! A DATA frame carries one envelope: a self-delimiting header block
//! followed by the protobuf payload bytes. The dispatcher reads the headers
//! first and only then picks the payload type by method, so the payload
//! stays opaque at this layer.
//!
//! ```text
//! [count: u8]
//! per entry: [name_len: u16 BE][name utf8][value_len: u16 BE][value utf8]
//! [payload: remaining bytes]
//! ```

use crate::MetaData;

/// Ceiling on header entries per envelope.
const MAX_ENTRIES: usize = 255;

/// Ceiling on a header name or value, in bytes.
const MAX_ENTRY_LEN: usize = u16::MAX as usize;

/// Errors from envelope encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// More header entries than the count byte can carry
    #[error("too many header entries (got {0})")]
    TooManyEntries(usize),
    /// A header name or value exceeds the length prefix
    #[error("header entry too large: {0}")]
    EntryTooLarge(String),
    /// The input ends inside a header entry
    #[error("truncated envelope")]
    Truncated,
    /// A header name or value is not valid UTF-8
    #[error("header entry is not valid UTF-8")]
    InvalidEncoding,
}

/// Encode a payload with its headers.
///
/// # Errors
/// Returns an error when the headers exceed the wire ceilings; the payload
/// itself is unconstrained here (the frame layer bounds it).
pub fn encode(payload: &[u8], meta: &MetaData) -> Result<Vec<u8>, EnvelopeError> {
    if meta.len() > MAX_ENTRIES {
        return Err(EnvelopeError::TooManyEntries(meta.len()));
    }

    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(meta.len() as u8);
    for (name, value) in meta.iter() {
        if name.len() > MAX_ENTRY_LEN || value.len() > MAX_ENTRY_LEN {
            return Err(EnvelopeError::EntryTooLarge(name.to_owned()));
        }
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode an envelope into its headers and the raw payload bytes.
///
/// # Errors
/// Returns an error on truncated input or non-UTF-8 header entries.
pub fn decode(bytes: &[u8]) -> Result<(MetaData, &[u8]), EnvelopeError> {
    let (&count, mut rest) = bytes.split_first().ok_or(EnvelopeError::Truncated)?;

    let mut meta = MetaData::new();
    for _ in 0..count {
        let (name, after_name) = read_entry(rest)?;
        let (value, after_value) = read_entry(after_name)?;
        meta.insert(name, value);
        rest = after_value;
    }
    Ok((meta, rest))
}

/// Read one length-prefixed UTF-8 string off the front of `bytes`.
fn read_entry(bytes: &[u8]) -> Result<(&str, &[u8]), EnvelopeError> {
    if bytes.len() < 2 {
        return Err(EnvelopeError::Truncated);
    }
    let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let rest = &bytes[2..];
    if rest.len() < len {
        return Err(EnvelopeError::Truncated);
    }
    let entry = std::str::from_utf8(&rest[..len]).map_err(|_| EnvelopeError::InvalidEncoding)?;
    Ok((entry, &rest[len..]))
}
