//! A minimal sample application (base spec §6 "`GET /account/:address`
//! (sample app passthrough)"): an account/balance ledger wired through
//! [`engine::Application`] so the RPC layer has something concrete to
//! serve. Txs are `bincode`-encoded [`Transfer`]s; anything else is
//! recorded as invalid rather than rejected at the network layer,
//! mirroring the teacher's own permissive `vm` tx admission.

use {
  crate::{
    consensus::{Block, Tx},
    engine::{Application, ExecuteResult},
    primitives::Pubkey,
  },
  serde::{Deserialize, Serialize},
  std::{
    collections::HashMap,
    sync::{Arc, RwLock},
  },
  tracing::warn,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Account {
  pub balance: u64,
  pub nonce: u64,
}

impl Default for Account {
  fn default() -> Self {
    Self { balance: 0, nonce: 0 }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
  pub from: Pubkey,
  pub to: Pubkey,
  pub amount: u64,
  pub nonce: u64,
}

/// A read-only handle onto the ledger, cloneable and shareable with
/// the RPC layer independent of the [`Engine`](crate::engine::Engine),
/// which otherwise holds the only mutable reference to the
/// application.
#[derive(Clone)]
pub struct AccountsView(Arc<RwLock<HashMap<Pubkey, Account>>>);

impl AccountsView {
  pub fn get(&self, address: &Pubkey) -> Account {
    self.0.read().expect("accounts lock poisoned").get(address).copied().unwrap_or_default()
  }
}

pub struct KvApp {
  accounts: Arc<RwLock<HashMap<Pubkey, Account>>>,
  last_height: u64,
  last_hash: Vec<u8>,
}

impl KvApp {
  pub fn new(genesis_balances: HashMap<Pubkey, u64>) -> Self {
    let accounts = genesis_balances
      .into_iter()
      .map(|(pk, balance)| (pk, Account { balance, nonce: 0 }))
      .collect();
    Self { accounts: Arc::new(RwLock::new(accounts)), last_height: 0, last_hash: vec![0u8; 32] }
  }

  pub fn view(&self) -> AccountsView {
    AccountsView(self.accounts.clone())
  }

  fn apply_transfer(&self, transfer: &Transfer) -> Result<(), String> {
    let mut accounts = self.accounts.write().expect("accounts lock poisoned");
    let sender = accounts.entry(transfer.from.clone()).or_default();
    if sender.nonce != transfer.nonce {
      return Err(format!("nonce mismatch: expected {}, got {}", sender.nonce, transfer.nonce));
    }
    if sender.balance < transfer.amount {
      return Err("insufficient balance".to_string());
    }
    sender.balance -= transfer.amount;
    sender.nonce += 1;
    accounts.entry(transfer.to.clone()).or_default().balance += transfer.amount;
    Ok(())
  }

  fn state_hash(&self) -> Vec<u8> {
    let accounts = self.accounts.read().expect("accounts lock poisoned");
    let mut leaves: Vec<(Pubkey, Account)> =
      accounts.iter().map(|(pk, acct)| (pk.clone(), *acct)).collect();
    leaves.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    let encoded = bincode::serialize(&leaves).expect("accounts encode");
    crate::consensus::tx_hash(&encoded).to_bytes().to_vec()
  }
}

impl Application for KvApp {
  fn new_round(&mut self, _height: u64, _round: u32) -> Vec<Tx> {
    vec![]
  }

  fn execute(&mut self, _height: u64, _round: u32, block: &Block) -> ExecuteResult {
    let mut valid_txs = vec![];
    let mut invalid_txs = vec![];
    for tx in &block.data.txs {
      match bincode::deserialize::<Transfer>(tx) {
        Ok(transfer) => match self.apply_transfer(&transfer) {
          Ok(()) => valid_txs.push(tx.clone()),
          Err(reason) => {
            warn!(?transfer, reason, "transfer rejected");
            invalid_txs.push(tx.clone());
          }
        },
        Err(_) => invalid_txs.push(tx.clone()),
      }
    }
    ExecuteResult { valid_txs, invalid_txs }
  }

  fn commit(&mut self, height: u64, _round: u32, _block: &Block) -> Result<Vec<u8>, String> {
    self.last_height = height;
    self.last_hash = self.state_hash();
    Ok(self.last_hash.clone())
  }

  fn last_committed(&self) -> (u64, Vec<u8>) {
    (self.last_height, self.last_hash.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pubkey(seed: u8) -> Pubkey {
    Pubkey::from_bytes([seed; 32])
  }

  fn sample_block(txs: Vec<Tx>) -> Block {
    use crate::consensus::{merkle_root, BlockBody, BlockId, Commit, Header};
    let header = Header {
      chain_id: "test".into(),
      height: 1,
      time: chrono::Utc::now(),
      num_txs: txs.len() as u64,
      last_block_id: BlockId::nil(),
      last_commit_hash: None,
      data_hash: crate::consensus::txs_hash(&txs),
      validators_hash: merkle_root(&[]),
      app_hash: vec![0u8; 32],
    };
    Block { header, data: BlockBody { txs }, last_commit: Commit::empty() }
  }

  #[test]
  fn transfer_moves_balance_between_accounts() {
    let alice = pubkey(1);
    let bob = pubkey(2);
    let mut genesis = HashMap::new();
    genesis.insert(alice.clone(), 100);
    let mut app = KvApp::new(genesis);
    let view = app.view();

    let transfer = Transfer { from: alice.clone(), to: bob.clone(), amount: 40, nonce: 0 };
    let tx = bincode::serialize(&transfer).unwrap();
    let block = sample_block(vec![tx]);

    let result = app.execute(1, 0, &block);
    assert_eq!(result.valid_txs.len(), 1);
    assert!(result.invalid_txs.is_empty());
    app.commit(1, 0, &block).unwrap();

    assert_eq!(view.get(&alice).balance, 60);
    assert_eq!(view.get(&bob).balance, 40);
  }

  #[test]
  fn transfer_with_insufficient_balance_is_invalid() {
    let alice = pubkey(1);
    let bob = pubkey(2);
    let mut app = KvApp::new(HashMap::new());
    let transfer = Transfer { from: alice, to: bob, amount: 40, nonce: 0 };
    let tx = bincode::serialize(&transfer).unwrap();
    let block = sample_block(vec![tx]);

    let result = app.execute(1, 0, &block);
    assert!(result.valid_txs.is_empty());
    assert_eq!(result.invalid_txs.len(), 1);
  }

  #[test]
  fn malformed_tx_is_recorded_invalid_not_rejected_at_block_level() {
    let mut app = KvApp::new(HashMap::new());
    let block = sample_block(vec![vec![0xff, 0x00, 0x01]]);
    let result = app.execute(1, 0, &block);
    assert_eq!(result.invalid_txs.len(), 1);
  }
}
