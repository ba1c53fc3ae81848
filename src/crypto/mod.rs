//! Credential envelope format. The key itself is supplied by
//! the caller — *obtaining* it is the external credential-decryption
//! utility's job, out of scope for this crate.

pub mod envelope;
