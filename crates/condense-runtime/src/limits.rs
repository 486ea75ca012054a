//! Resource limits applied to untrusted miner responses and generated tasks.
//!
//! Miner replies are parsed only after these bounds are checked, so a
//! misbehaving miner cannot make the validator allocate without limit.

/// Maximum raw body size accepted from a miner (16 MB).
pub const MAX_MINER_RESPONSE_BYTES: usize = 16 * 1_048_576;

/// Maximum soft-token width accepted when a tier does not fix one.
pub const MAX_SOFT_TOKEN_WIDTH: usize = 16_384;

/// Maximum corpus passages drawn while filling one context.
pub const MAX_PASSAGE_DRAWS: usize = 4_096;

/// Maximum size of a single corpus file loaded from disk (8 MB).
pub const MAX_CORPUS_FILE_BYTES: u64 = 8 * 1_048_576;
