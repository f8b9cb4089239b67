//! Standalone key-generation utility: prints `priv_validator.json`-
//! compatible keypairs without booting a whole node.

use {dengine::primitives::Keypair, rand::thread_rng};

fn main() {
  let count: u32 = std::env::args()
    .nth(1)
    .unwrap_or_else(|| "1".to_owned())
    .parse()
    .unwrap();

  for _ in 0..count {
    let keypair = Keypair::generate(&mut thread_rng());
    println!("pubkey: {}", bs58::encode(keypair.public().as_bytes()).into_string());
    println!("secret: {}", bs58::encode(keypair.secret().as_bytes()).into_string());
    println!();
  }
}
