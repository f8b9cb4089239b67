//! `addrbook.json` (base spec §6): the set of peer addresses this node
//! knows about, persisted across restarts so it doesn't have to
//! rediscover the network from seeds every time.

use {
  serde::{Deserialize, Serialize},
  std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
  },
  thiserror::Error,
};

#[derive(Debug, Error)]
pub enum AddrBookError {
  #[error("I/O error loading address book: {0}")]
  Io(#[from] std::io::Error),

  #[error("malformed addrbook.json: {0}")]
  Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownPeer {
  pub addr: SocketAddr,
  /// Number of consecutive failed dial attempts. A `pex_reactor` with
  /// `addrbook_strict` enabled stops retrying past a small threshold.
  #[serde(default)]
  pub attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddrBook {
  pub peers: Vec<KnownPeer>,
}

impl AddrBook {
  pub fn load(path: impl AsRef<Path>) -> Result<Self, AddrBookError> {
    match fs::read(path.as_ref()) {
      Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
      Err(e) => Err(e.into()),
    }
  }

  pub fn save(&self, path: impl AsRef<Path>) -> Result<(), AddrBookError> {
    let bytes = serde_json::to_vec_pretty(self)?;
    fs::write(path, bytes)?;
    Ok(())
  }

  pub fn add(&mut self, addr: SocketAddr) {
    if !self.peers.iter().any(|p| p.addr == addr) {
      self.peers.push(KnownPeer { addr, attempts: 0 });
    }
  }

  pub fn mark_failed(&mut self, addr: SocketAddr) {
    if let Some(p) = self.peers.iter_mut().find(|p| p.addr == addr) {
      p.attempts += 1;
    }
  }

  /// Peers worth dialing: below the retry ceiling `addrbook_strict`
  /// enforces when enabled.
  pub fn dialable(&self, strict: bool) -> Vec<SocketAddr> {
    const MAX_ATTEMPTS: u32 = 16;
    self
      .peers
      .iter()
      .filter(|p| !strict || p.attempts < MAX_ATTEMPTS)
      .map(|p| p.addr)
      .collect()
  }
}

pub fn default_path(data_dir: &Path) -> PathBuf {
  data_dir.join("addrbook.json")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_file_loads_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let book = AddrBook::load(dir.path().join("addrbook.json")).unwrap();
    assert!(book.peers.is_empty());
  }

  #[test]
  fn save_then_load_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("addrbook.json");
    let mut book = AddrBook::default();
    book.add("127.0.0.1:44668".parse().unwrap());
    book.save(&path).unwrap();

    let reloaded = AddrBook::load(&path).unwrap();
    assert_eq!(reloaded.peers.len(), 1);
  }

  #[test]
  fn strict_mode_drops_peers_past_attempt_ceiling() {
    let mut book = AddrBook::default();
    let addr = "127.0.0.1:1".parse().unwrap();
    book.add(addr);
    for _ in 0..20 {
      book.mark_failed(addr);
    }
    assert!(book.dialable(true).is_empty());
    assert_eq!(book.dialable(false).len(), 1);
  }
}
