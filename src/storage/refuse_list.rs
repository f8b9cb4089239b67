use {super::{Error, CF_REFUSE_LIST}, crate::primitives::Pubkey, rocksdb::DB, std::sync::Arc};

/// The set of banned peer public keys (base spec §4.1/§4.2). Every
/// mutation is a synchronous write — a node must never forget a ban
/// across a crash, since that's the only thing standing between a
/// known-bad peer and a reconnect.
#[derive(Clone)]
pub struct RefuseList {
  db: Arc<DB>,
}

impl RefuseList {
  pub(super) fn new(db: Arc<DB>) -> Self {
    Self { db }
  }

  fn cf(&self) -> &rocksdb::ColumnFamily {
    self
      .db
      .cf_handle(CF_REFUSE_LIST)
      .expect("refuse_list column family registered at open")
  }

  pub fn add(&self, pubkey: &Pubkey) -> Result<(), Error> {
    let mut write_opts = rocksdb::WriteOptions::default();
    write_opts.set_sync(true);
    self.db.put_cf_opt(self.cf(), pubkey.as_bytes(), [], &write_opts)?;
    Ok(())
  }

  pub fn remove(&self, pubkey: &Pubkey) -> Result<(), Error> {
    let mut write_opts = rocksdb::WriteOptions::default();
    write_opts.set_sync(true);
    self.db.delete_cf_opt(self.cf(), pubkey.as_bytes(), &write_opts)?;
    Ok(())
  }

  pub fn contains(&self, pubkey: &Pubkey) -> Result<bool, Error> {
    Ok(self.db.get_cf(self.cf(), pubkey.as_bytes())?.is_some())
  }

  pub fn list_all(&self) -> Result<Vec<Pubkey>, Error> {
    let mut out = vec![];
    for item in self.db.iterator_cf(self.cf(), rocksdb::IteratorMode::Start) {
      let (key, _) = item?;
      if let Ok(bytes) = <[u8; 32]>::try_from(key.as_ref()) {
        out.push(Pubkey::from_bytes(bytes));
      }
    }
    Ok(out)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn temp_store() -> (Arc<DB>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = rocksdb::Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    let db = DB::open_cf(&opts, dir.path(), [super::CF_REFUSE_LIST]).unwrap();
    (Arc::new(db), dir)
  }

  #[test]
  fn add_remove_and_contains_roundtrip() {
    let (db, _dir) = temp_store();
    let list = RefuseList::new(db);
    let pk = Pubkey::from_bytes([7u8; 32]);

    assert!(!list.contains(&pk).unwrap());
    list.add(&pk).unwrap();
    assert!(list.contains(&pk).unwrap());
    assert_eq!(list.list_all().unwrap(), vec![pk.clone()]);
    list.remove(&pk).unwrap();
    assert!(!list.contains(&pk).unwrap());
  }
}
