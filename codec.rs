//! Fixed-layout codecs shared by the facade and the byte-keyed backends.
//!
//! A stored value is a contiguous buffer: 8 bytes of `term`, 8 bytes of
//! `cmd` (both native endianness), then the raw data blob. Keys cross the
//! backend boundary as `u64`; engines whose native key type is a byte
//! string encode them 8-byte big-endian so lexicographic order matches
//! numeric order.

/// Byte offset where the data blob starts inside a packed value.
pub const VALUE_HEADER_LEN: usize = 16;

/// Packs `(term, cmd, data)` into a single contiguous value buffer.
pub fn pack_value(term: u64, cmd: u64, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(VALUE_HEADER_LEN + data.len());
    buf.extend_from_slice(&term.to_ne_bytes());
    buf.extend_from_slice(&cmd.to_ne_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Splits a packed value into `(term, cmd, data)`.
///
/// Truncated buffers decode with zeroed metadata and whatever data bytes
/// remain past the header, so a corrupt short record never panics.
pub fn unpack_value(buf: &[u8]) -> (u64, u64, &[u8]) {
    let term = read_u64_ne(buf, 0);
    let cmd = read_u64_ne(buf, 8);
    let data = if buf.len() > VALUE_HEADER_LEN {
        &buf[VALUE_HEADER_LEN..]
    } else {
        &[]
    };
    (term, cmd, data)
}

/// Length of the data blob inside a packed value.
pub fn unpacked_data_len(buf: &[u8]) -> usize {
    buf.len().saturating_sub(VALUE_HEADER_LEN)
}

fn read_u64_ne(buf: &[u8], offset: usize) -> u64 {
    match buf.get(offset..offset + 8) {
        Some(bytes) => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            u64::from_ne_bytes(raw)
        }
        None => 0,
    }
}

/// Encodes a key for byte-string engines: 8-byte big-endian, so the engine's
/// lexicographic order is the numeric order.
pub fn encode_key(key: u64) -> [u8; 8] {
    key.to_be_bytes()
}

/// Decodes a big-endian key produced by [`encode_key`].
pub fn decode_key(raw: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = raw.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Encodes a TTL deadline (milliseconds since epoch) as a table value.
pub fn encode_deadline(at_ms: u64) -> Vec<u8> {
    at_ms.to_ne_bytes().to_vec()
}

/// Decodes a TTL deadline; short buffers read as 0 (already expired).
pub fn decode_deadline(raw: &[u8]) -> u64 {
    read_u64_ne(raw, 0)
}
