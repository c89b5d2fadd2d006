use rand::RngCore;

/// Bytes of randomness behind a generated trace id (32 hex chars).
pub const TRACE_ID_BYTES: usize = 16;
/// Bytes of randomness behind a request id (24 hex chars).
pub const REQUEST_ID_BYTES: usize = 12;
/// Bytes of randomness behind a batch object suffix (16 hex chars).
pub const BATCH_SUFFIX_BYTES: usize = 8;

/// Lowercase hex string of `n_bytes` drawn from the thread-local CSPRNG.
pub fn random_hex(n_bytes: usize) -> String {
    let mut buf = vec![0u8; n_bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn trace_id() -> String {
    random_hex(TRACE_ID_BYTES)
}

pub fn request_id() -> String {
    random_hex(REQUEST_ID_BYTES)
}

pub fn batch_suffix() -> String {
    random_hex(BATCH_SUFFIX_BYTES)
}
