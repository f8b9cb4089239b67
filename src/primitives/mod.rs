mod keys;
pub mod wire;

pub use keys::{Keypair, KeypairError, Pubkey, Signature};
