use {
  super::{Error, CF_STATE},
  crate::consensus::{validator::ValidatorSet, BlockId},
  chrono::{DateTime, Utc},
  rocksdb::DB,
  serde::{Deserialize, Serialize},
  std::sync::Arc,
};

const KEY_STATE: &[u8] = b"state";
const KEY_INTERMEDIATE: &[u8] = b"intermediate";

/// The single `state` key (base spec §4.1), plus the `intermediate`
/// key written just before the app `Commit` hook fires so a crash
/// between `SaveBlock` and `Commit` can be detected on restart
/// (§4.7/§4.8 recovery table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredState {
  pub chain_id: String,
  pub last_block_height: u64,
  pub last_block_id: BlockId,
  pub last_block_time: DateTime<Utc>,
  pub validators: ValidatorSet,
  pub last_validators: ValidatorSet,
  pub app_hash: Vec<u8>,
  pub plugins: Vec<String>,
}

#[derive(Clone)]
pub struct StateStore {
  db: Arc<DB>,
}

impl StateStore {
  pub(super) fn new(db: Arc<DB>) -> Self {
    Self { db }
  }

  fn cf(&self) -> &rocksdb::ColumnFamily {
    self.db.cf_handle(CF_STATE).expect("state column family registered at open")
  }

  pub fn load(&self) -> Result<Option<StoredState>, Error> {
    match self.db.get_cf(self.cf(), KEY_STATE)? {
      Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
      None => Ok(None),
    }
  }

  pub fn save(&self, state: &StoredState) -> Result<(), Error> {
    let mut write_opts = rocksdb::WriteOptions::default();
    write_opts.set_sync(true);
    self
      .db
      .put_cf_opt(self.cf(), KEY_STATE, bincode::serialize(state)?, &write_opts)?;
    Ok(())
  }

  /// Written right before the app `Commit` hook runs; cleared right
  /// after it returns. If this key is present on startup, the process
  /// crashed mid-commit and recovery must replay from it rather than
  /// trusting `last_block_height` alone.
  pub fn save_intermediate(&self, state: &StoredState) -> Result<(), Error> {
    let mut write_opts = rocksdb::WriteOptions::default();
    write_opts.set_sync(true);
    self.db.put_cf_opt(
      self.cf(),
      KEY_INTERMEDIATE,
      bincode::serialize(state)?,
      &write_opts,
    )?;
    Ok(())
  }

  pub fn load_intermediate(&self) -> Result<Option<StoredState>, Error> {
    match self.db.get_cf(self.cf(), KEY_INTERMEDIATE)? {
      Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
      None => Ok(None),
    }
  }

  pub fn clear_intermediate(&self) -> Result<(), Error> {
    self.db.delete_cf(self.cf(), KEY_INTERMEDIATE)?;
    Ok(())
  }
}
