// Cryptography module — shared-key sealing of mesh payloads

pub mod seal;

pub use seal::{MeshCipher, SealError, SEAL_OVERHEAD};
