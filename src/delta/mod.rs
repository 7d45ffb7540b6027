//! Rolling-hash delta codec: signatures, delta generation, delta
//! application. Pure transformers — no policy, no encryption, no
//! compression.

pub mod codec;

pub use codec::{apply_delta, generate_delta, generate_signature, BlockSum, Signature};
pub use codec::{BLOCK_SIZE, STRONG_LEN};
