use {
  super::{Error, CF_BLOCKS, CF_COMMITS, CF_PARTS},
  crate::consensus::{Block, Commit, Part},
  rocksdb::DB,
  std::sync::Arc,
};

/// `H/meta`, `H/part/i`, `H/commit` (base spec §4.1), laid out across
/// three column families instead of three key prefixes since
/// `rocksdb` gives us that for free and it keeps part scans cheap.
#[derive(Clone)]
pub struct BlockStore {
  db: Arc<DB>,
}

fn height_key(height: u64) -> [u8; 8] {
  height.to_be_bytes()
}

fn part_key(height: u64, index: u32) -> [u8; 12] {
  let mut key = [0u8; 12];
  key[..8].copy_from_slice(&height.to_be_bytes());
  key[8..].copy_from_slice(&index.to_be_bytes());
  key
}

impl BlockStore {
  pub(super) fn new(db: Arc<DB>) -> Self {
    Self { db }
  }

  fn cf(&self, name: &str) -> &rocksdb::ColumnFamily {
    self.db.cf_handle(name).expect("column family registered at open")
  }

  /// Highest height with a durably saved block, 0 if the store is empty.
  pub fn height(&self) -> Result<u64, Error> {
    let cf = self.cf(CF_BLOCKS);
    let mut iter = self.db.raw_iterator_cf(cf);
    iter.seek_to_last();
    Ok(match iter.key() {
      Some(key) => u64::from_be_bytes(key.try_into().expect("8-byte height key")),
      None => 0,
    })
  }

  pub fn load_block(&self, height: u64) -> Result<Option<Block>, Error> {
    match self.db.get_cf(self.cf(CF_BLOCKS), height_key(height))? {
      Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
      None => Ok(None),
    }
  }

  pub fn load_block_part(&self, height: u64, index: u32) -> Result<Option<Part>, Error> {
    match self.db.get_cf(self.cf(CF_PARTS), part_key(height, index))? {
      Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
      None => Ok(None),
    }
  }

  pub fn load_seen_commit(&self, height: u64) -> Result<Option<Commit>, Error> {
    match self.db.get_cf(self.cf(CF_COMMITS), height_key(height))? {
      Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
      None => Ok(None),
    }
  }

  /// Atomic with respect to [`Self::height`]: the block, every part,
  /// and the commit land in one `rocksdb` write batch, so a crash
  /// mid-save can never advance height without a complete block.
  pub fn save_block(
    &self,
    block: &Block,
    parts: &[Part],
    commit: &Commit,
  ) -> Result<(), Error> {
    let height = block.header.height;
    let mut batch = rocksdb::WriteBatch::default();
    batch.put_cf(self.cf(CF_BLOCKS), height_key(height), bincode::serialize(block)?);
    for part in parts {
      batch.put_cf(
        self.cf(CF_PARTS),
        part_key(height, part.index),
        bincode::serialize(part)?,
      );
    }
    batch.put_cf(self.cf(CF_COMMITS), height_key(height), bincode::serialize(commit)?);

    let mut write_opts = rocksdb::WriteOptions::default();
    write_opts.set_sync(true);
    self.db.write_opt(batch, &write_opts)?;
    Ok(())
  }
}
