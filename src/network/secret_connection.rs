//! The handshake base spec §4.2 names: ephemeral X25519 key agreement
//! producing a shared symmetric key, then every frame AEAD-sealed
//! under it. Modeled on Tendermint's `SecretConnection`, but using
//! `chacha20poly1305` instead of NaCl secretbox since that's the AEAD
//! this workspace already depends on.

use {
  chacha20poly1305::{
    aead::{Aead, NewAead},
    ChaCha20Poly1305,
    Key,
    Nonce,
  },
  rand::RngCore,
  thiserror::Error,
  tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
      tcp::{OwnedReadHalf, OwnedWriteHalf},
      TcpStream,
    },
  },
  x25519_dalek::{PublicKey as X25519Public, StaticSecret},
};

const MAX_FRAME_LEN: usize = 1 << 20; // 1 MiB
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum HandshakeError {
  #[error("I/O error during handshake: {0}")]
  Io(#[from] std::io::Error),

  #[error("frame exceeds maximum length of {MAX_FRAME_LEN} bytes")]
  FrameTooLarge,

  #[error("AEAD decryption failed: peer is not using the same shared secret")]
  DecryptionFailed,
}

/// A TCP stream wrapped in the post-handshake AEAD, one direction at
/// a time: nonces are derived from a per-connection counter so
/// replaying a captured frame back at either side fails decryption.
pub struct SecretConnection<S> {
  inner: S,
  cipher: ChaCha20Poly1305,
  send_nonce: u64,
  recv_nonce: u64,
}

fn nonce_for(counter: u64) -> Nonce {
  let mut bytes = [0u8; NONCE_LEN];
  bytes[4..].copy_from_slice(&counter.to_be_bytes());
  *Nonce::from_slice(&bytes)
}

impl<S> SecretConnection<S>
where
  S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
  /// Runs the ephemeral X25519 handshake over `stream` and returns a
  /// connection ready to exchange AEAD-sealed frames. `initiator`
  /// only affects which side's public key is sent first, to avoid a
  /// simultaneous-write deadlock; the derived key is symmetric.
  pub async fn handshake(mut stream: S, initiator: bool) -> Result<Self, HandshakeError> {
    // built from raw bytes rather than `EphemeralSecret::new`, which
    // pins an older `rand_core` than the `rand` version used
    // elsewhere in this workspace (same reasoning as
    // primitives::keys::Keypair::generate); dropped after this
    // handshake so it's used exactly once regardless.
    let mut secret_bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret_bytes);
    let my_secret = StaticSecret::from(secret_bytes);
    let my_public = X25519Public::from(&my_secret);

    let mut peer_public_bytes = [0u8; 32];
    if initiator {
      stream.write_all(my_public.as_bytes()).await?;
      stream.read_exact(&mut peer_public_bytes).await?;
    } else {
      stream.read_exact(&mut peer_public_bytes).await?;
      stream.write_all(my_public.as_bytes()).await?;
    }

    let shared = my_secret.diffie_hellman(&X25519Public::from(peer_public_bytes));
    let key = Key::from_slice(shared.as_bytes());
    let cipher = ChaCha20Poly1305::new(key);

    Ok(Self { inner: stream, cipher, send_nonce: 0, recv_nonce: 0 })
  }

  pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), HandshakeError> {
    if payload.len() > MAX_FRAME_LEN {
      return Err(HandshakeError::FrameTooLarge);
    }
    let nonce = nonce_for(self.send_nonce);
    self.send_nonce += 1;
    let ciphertext = self
      .cipher
      .encrypt(&nonce, payload)
      .map_err(|_| HandshakeError::DecryptionFailed)?;
    self.inner.write_u32(ciphertext.len() as u32).await?;
    self.inner.write_all(&ciphertext).await?;
    Ok(())
  }

  pub async fn recv_frame(&mut self) -> Result<Vec<u8>, HandshakeError> {
    let len = self.inner.read_u32().await? as usize;
    if len > MAX_FRAME_LEN + 16 {
      return Err(HandshakeError::FrameTooLarge);
    }
    let mut ciphertext = vec![0u8; len];
    self.inner.read_exact(&mut ciphertext).await?;
    let nonce = nonce_for(self.recv_nonce);
    self.recv_nonce += 1;
    self
      .cipher
      .decrypt(&nonce, ciphertext.as_ref())
      .map_err(|_| HandshakeError::DecryptionFailed)
  }
}

impl SecretConnection<TcpStream> {
  /// Splits a handshaked connection into independent read/write
  /// halves so the reactor can run its recv loop and its per-peer
  /// send queue as two tasks instead of interleaving both directions
  /// through one `&mut self`. The AEAD key is shared; each half keeps
  /// its own nonce counter exactly as the unsplit connection did.
  pub fn split(self) -> (SecretConnectionReader<OwnedReadHalf>, SecretConnectionWriter<OwnedWriteHalf>) {
    let (read_half, write_half) = self.inner.into_split();
    (
      SecretConnectionReader { inner: read_half, cipher: self.cipher.clone(), recv_nonce: self.recv_nonce },
      SecretConnectionWriter { inner: write_half, cipher: self.cipher, send_nonce: self.send_nonce },
    )
  }
}

pub struct SecretConnectionReader<R> {
  inner: R,
  cipher: ChaCha20Poly1305,
  recv_nonce: u64,
}

impl<R: tokio::io::AsyncRead + Unpin> SecretConnectionReader<R> {
  pub async fn recv_frame(&mut self) -> Result<Vec<u8>, HandshakeError> {
    let len = self.inner.read_u32().await? as usize;
    if len > MAX_FRAME_LEN + 16 {
      return Err(HandshakeError::FrameTooLarge);
    }
    let mut ciphertext = vec![0u8; len];
    self.inner.read_exact(&mut ciphertext).await?;
    let nonce = nonce_for(self.recv_nonce);
    self.recv_nonce += 1;
    self
      .cipher
      .decrypt(&nonce, ciphertext.as_ref())
      .map_err(|_| HandshakeError::DecryptionFailed)
  }
}

pub struct SecretConnectionWriter<W> {
  inner: W,
  cipher: ChaCha20Poly1305,
  send_nonce: u64,
}

impl<W: tokio::io::AsyncWrite + Unpin> SecretConnectionWriter<W> {
  pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), HandshakeError> {
    if payload.len() > MAX_FRAME_LEN {
      return Err(HandshakeError::FrameTooLarge);
    }
    let nonce = nonce_for(self.send_nonce);
    self.send_nonce += 1;
    let ciphertext = self
      .cipher
      .encrypt(&nonce, payload)
      .map_err(|_| HandshakeError::DecryptionFailed)?;
    self.inner.write_u32(ciphertext.len() as u32).await?;
    self.inner.write_all(&ciphertext).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn handshake_then_frame_roundtrips() {
    let (client, server) = tokio::io::duplex(4096);
    let client_fut = SecretConnection::handshake(client, true);
    let server_fut = SecretConnection::handshake(server, false);
    let (client, server) = tokio::join!(client_fut, server_fut);
    let mut client = client.unwrap();
    let mut server = server.unwrap();

    client.send_frame(b"hello").await.unwrap();
    let received = server.recv_frame().await.unwrap();
    assert_eq!(received, b"hello");
  }
}
