//! Durable storage (base spec §4.1): three logical stores over one
//! `rocksdb` instance with a column family apiece, plus the
//! ban-list column family the P2P switch consults on every handshake.

mod blocks;
mod refuse_list;
mod state;

use {
  rocksdb::{Options, DB},
  std::{path::Path, sync::Arc},
  thiserror::Error,
};

pub use {
  blocks::BlockStore,
  refuse_list::RefuseList,
  state::{StateStore, StoredState},
};

pub const CF_BLOCKS: &str = "blocks";
pub const CF_COMMITS: &str = "commits";
pub const CF_PARTS: &str = "parts";
pub const CF_STATE: &str = "state";
pub const CF_REFUSE_LIST: &str = "refuse_list";

#[derive(Debug, Error)]
pub enum Error {
  #[error("serialization error: {0}")]
  Serialization(#[from] bincode::Error),

  #[error("storage engine error: {0}")]
  StorageEngine(#[from] rocksdb::Error),

  #[error("system I/O error: {0}")]
  SystemIo(#[from] std::io::Error),

  #[error("not found")]
  NotFound,
}

/// Opens the one `rocksdb` instance backing all three logical stores
/// and hands out a cheaply-cloned view onto each column family.
#[derive(Clone)]
pub struct Store {
  db: Arc<DB>,
}

impl Store {
  pub fn open(directory: impl AsRef<Path>) -> Result<Self, Error> {
    std::fs::create_dir_all(&directory)?;
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    let db = DB::open_cf(
      &opts,
      directory,
      [CF_BLOCKS, CF_COMMITS, CF_PARTS, CF_STATE, CF_REFUSE_LIST],
    )?;
    Ok(Self { db: Arc::new(db) })
  }

  pub fn blocks(&self) -> BlockStore {
    BlockStore::new(Arc::clone(&self.db))
  }

  pub fn state(&self) -> StateStore {
    StateStore::new(Arc::clone(&self.db))
  }

  pub fn refuse_list(&self) -> RefuseList {
    RefuseList::new(Arc::clone(&self.db))
  }
}
