//! HTTP front door (base spec §6): a thin `axum` service over shared
//! handles onto the mempool, block store, sample application and
//! specialop plugin. Unlike the teacher's RPC service, submitted txs
//! are gossiped directly from the handler through a [`NetworkHandle`]
//! and a mempool shared with the consensus round driver via
//! `tokio::sync::Mutex`, so this service has no need to forward
//! anything back to the main select loop — see DESIGN.md for why the
//! `impl Stream` shape was dropped.

use {
  crate::{
    app::{Account, AccountsView},
    consensus::{tx_hash, Tx, ValidatorSet},
    mempool::Mempool,
    network::NetworkHandle,
    plugin::SharedSpecialop,
    primitives::{Pubkey, Signature},
    storage::BlockStore,
  },
  axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json,
    Router,
  },
  axum_extra::response::ErasedJson,
  multihash::Multihash,
  serde::Deserialize,
  serde_json::json,
  std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
      atomic::{AtomicU64, AtomicUsize, Ordering},
      Arc,
      Mutex as StdMutex,
    },
    time::Duration,
  },
  tokio::sync::{oneshot, Mutex as TokioMutex},
  tracing::warn,
};

/// How long `broadcast_tx_commit` waits for its tx's block to land
/// before degrading to a pending response.
const COMMIT_WAIT: Duration = Duration::from_secs(10);

/// What the main loop reports back to a parked `broadcast_tx_commit`
/// once the block containing its tx has been applied.
#[derive(Debug, Clone)]
pub enum CommitOutcome {
  Committed { height: u64 },
}

/// Handles shared between every route and, for gossip and commit
/// waiters, with the consensus round driver in `main`.
#[derive(Clone)]
pub struct SharedChainState {
  pub chain_id: String,
  pub moniker: String,
  pub height: Arc<AtomicU64>,
  pub validators: Arc<StdMutex<ValidatorSet>>,
  pub peer_count: Arc<AtomicUsize>,
  pub blocks: BlockStore,
  pub accounts: AccountsView,
  pub specialop: SharedSpecialop,
  pub mempool: Arc<TokioMutex<Mempool>>,
  pub network: NetworkHandle,
  commit_waiters: Arc<StdMutex<HashMap<Multihash, oneshot::Sender<CommitOutcome>>>>,
}

impl SharedChainState {
  pub fn new(
    chain_id: String,
    moniker: String,
    validators: ValidatorSet,
    blocks: BlockStore,
    accounts: AccountsView,
    specialop: SharedSpecialop,
    mempool: Arc<TokioMutex<Mempool>>,
    network: NetworkHandle,
  ) -> Self {
    Self {
      chain_id,
      moniker,
      height: Arc::new(AtomicU64::new(0)),
      validators: Arc::new(StdMutex::new(validators)),
      peer_count: Arc::new(AtomicUsize::new(0)),
      blocks,
      accounts,
      specialop,
      mempool,
      network,
      commit_waiters: Arc::new(StdMutex::new(HashMap::new())),
    }
  }

  /// Called by the round driver once a block commits, so any
  /// `broadcast_tx_commit` callers parked on one of its txs can
  /// return.
  pub fn resolve_commits(&self, committed: &[Tx], height: u64) {
    let mut waiters = self.commit_waiters.lock().expect("commit waiters lock poisoned");
    for tx in committed {
      if let Some(waiter) = waiters.remove(&tx_hash(tx)) {
        let _ = waiter.send(CommitOutcome::Committed { height });
      }
    }
  }
}

/// Binds the service to every address in `addrs`, each in its own
/// spawned task, mirroring the teacher's one-router-many-listeners
/// layout.
pub fn serve(addrs: Vec<SocketAddr>, state: SharedChainState) {
  let shared = Arc::new(state);
  let router = Router::new()
    .route("/status", get(serve_status))
    .route("/net_info", get(serve_net_info))
    .route("/account/:address", get(serve_account))
    .route("/broadcast_tx_sync", post(serve_broadcast_tx_sync))
    .route("/broadcast_tx_commit", post(serve_broadcast_tx_commit))
    .route("/specialop", post(serve_specialop))
    .layer(Extension(shared));

  addrs.into_iter().for_each(|addr| {
    let router = router.clone();
    tokio::spawn(async move {
      axum::Server::bind(&addr).serve(router.into_make_service()).await.unwrap();
    });
  });
}

async fn serve_status(
  Extension(state): Extension<Arc<SharedChainState>>,
) -> impl IntoResponse {
  let validators = state.validators.lock().expect("validators lock poisoned");
  ErasedJson::pretty(json!({
    "chain_id": state.chain_id,
    "moniker": state.moniker,
    "height": state.height.load(Ordering::Relaxed),
    "validators": validators.size(),
    "voting_power": validators.total_power(),
  }))
}

async fn serve_net_info(
  Extension(state): Extension<Arc<SharedChainState>>,
) -> impl IntoResponse {
  ErasedJson::pretty(json!({
    "n_peers": state.peer_count.load(Ordering::Relaxed),
  }))
}

async fn serve_account(
  Path(address): Path<Pubkey>,
  Extension(state): Extension<Arc<SharedChainState>>,
) -> impl IntoResponse {
  let Account { balance, nonce } = state.accounts.get(&address);
  ErasedJson::pretty(json!({
    "address": address,
    "balance": balance,
    "nonce": nonce,
  }))
}

async fn serve_broadcast_tx_sync(
  Json(tx): Json<Tx>,
  Extension(state): Extension<Arc<SharedChainState>>,
) -> impl IntoResponse {
  let hash = tx_hash(&tx);
  if let Err(reason) = state.mempool.lock().await.check_tx(tx.clone()) {
    return (
      StatusCode::BAD_REQUEST,
      ErasedJson::pretty(json!({ "hash": hash.to_bytes(), "error": reason })),
    );
  }
  if let Err(e) = state.network.gossip_tx(tx) {
    warn!("failed to gossip admitted tx: {e}");
  }
  (StatusCode::OK, ErasedJson::pretty(json!({ "hash": hash.to_bytes() })))
}

async fn serve_broadcast_tx_commit(
  Json(tx): Json<Tx>,
  Extension(state): Extension<Arc<SharedChainState>>,
) -> impl IntoResponse {
  let hash = tx_hash(&tx);
  if let Err(reason) = state.mempool.lock().await.check_tx(tx.clone()) {
    return (
      StatusCode::BAD_REQUEST,
      ErasedJson::pretty(json!({ "hash": hash.to_bytes(), "error": reason })),
    );
  }

  let (tx_done, rx_done) = oneshot::channel();
  state.commit_waiters.lock().expect("commit waiters lock poisoned").insert(hash, tx_done);

  if let Err(e) = state.network.gossip_tx(tx) {
    warn!("failed to gossip admitted tx: {e}");
  }

  match tokio::time::timeout(COMMIT_WAIT, rx_done).await {
    Ok(Ok(CommitOutcome::Committed { height })) => (
      StatusCode::OK,
      ErasedJson::pretty(json!({ "hash": hash.to_bytes(), "height": height })),
    ),
    Ok(Err(_)) => (
      StatusCode::INTERNAL_SERVER_ERROR,
      ErasedJson::pretty(json!({ "hash": hash.to_bytes(), "error": "commit waiter dropped" })),
    ),
    Err(_) => {
      state.commit_waiters.lock().expect("commit waiters lock poisoned").remove(&hash);
      warn!(hash = ?hash, "broadcast_tx_commit timed out waiting for commit");
      (
        StatusCode::ACCEPTED,
        ErasedJson::pretty(json!({ "hash": hash.to_bytes(), "status": "pending" })),
      )
    }
  }
}

#[derive(Deserialize)]
struct SpecialopRequest {
  op_id: [u8; 32],
  signer: Pubkey,
  signature: Signature,
}

async fn serve_specialop(
  Json(req): Json<SpecialopRequest>,
  Extension(state): Extension<Arc<SharedChainState>>,
) -> impl IntoResponse {
  let validators = state.validators.lock().expect("validators lock poisoned").clone();
  let signer = match validators.get_by_pubkey(&req.signer) {
    Some((_, validator)) => validator.clone(),
    None => {
      return (
        StatusCode::BAD_REQUEST,
        ErasedJson::pretty(json!({ "error": "unknown validator" })),
      )
    }
  };

  if !req.signature.verify(&req.signer, &req.op_id) {
    return (
      StatusCode::BAD_REQUEST,
      ErasedJson::pretty(json!({ "error": "bad signature" })),
    );
  }

  match state.specialop.record_vote(req.op_id, &signer, &req.signature, &validators) {
    Ok(()) => (StatusCode::OK, ErasedJson::pretty(json!({ "op_id": req.op_id }))),
    Err(e) => (
      StatusCode::BAD_REQUEST,
      ErasedJson::pretty(json!({ "op_id": req.op_id, "error": e.to_string() })),
    ),
  }
}
