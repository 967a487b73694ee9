//! Cryptographic primitives used to name requests and application
//! state. Signing and signature verification are not implemented
//! here; they are hooks provided by the process hosting a replica.

pub mod hash;
