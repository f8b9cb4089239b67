//! The validator runloop (base spec §4): boots storage, the
//! application, the CA-gated P2P switch and the RPC front door, then
//! drives either a [`BlockPool`] (fast-sync) or a [`ConsensusDriver`]
//! (live BFT rounds) from one flat `tokio::select!`, the way the
//! teacher's `main` drove `chain`/`producer`/`schedule` from a single
//! loop rather than a tree of spawned tasks.

mod app;
mod cli;
mod consensus;
mod driver;
mod engine;
mod mempool;
mod network;
mod plugin;
mod primitives;
mod rpc;
mod storage;

use {
  crate::{
    cli::CliOpts,
    consensus::{
      Block, BlockId, Commit, Part, PartSet, Proposal, Step, TimeoutConfig, ValidatorSet,
    },
    driver::{ConsensusDriver, DriverOutput},
    engine::Engine,
    mempool::Mempool,
    network::{BlockPool, Network, NetworkEvent, PeerAuthorizer, PeerCertificate},
    plugin::Plugin,
    primitives::{wire, Pubkey},
    storage::{RefuseList, Store, StoredState},
  },
  clap::Parser,
  futures::{FutureExt, StreamExt},
  std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{atomic::Ordering, Arc},
    time::Duration,
  },
  tokio::{sync::Mutex as TokioMutex, time::Instant},
  tracing::{debug, error, info, warn, Level},
  tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer},
};

#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Whichever of the two block-acquisition strategies is currently
/// driving the node. A node starts in one or the other and can fall
/// back from `Consensus` to `FastSync` if it ever commits to a block
/// it never actually received.
enum Mode {
  FastSync(BlockPool),
  Consensus(ConsensusDriver),
}

fn hex_decode(s: &str) -> Vec<u8> {
  (0..s.len())
    .step_by(2)
    .filter_map(|i| s.get(i..i + 2).and_then(|byte| u8::from_str_radix(byte, 16).ok()))
    .collect()
}

fn issue_requests(pool: &mut BlockPool, network: &Network) {
  for req in pool.requests_due() {
    if let Err(e) = network.request_block(req.peer, req.height) {
      warn!("failed to request block {}: {e}", req.height);
    }
  }
}

fn build_fallback_pool(
  engine: &Engine,
  refuse_list: &RefuseList,
  known_peer_heights: &HashMap<Pubkey, u64>,
) -> BlockPool {
  let our_height = engine.blocks().height().unwrap_or(0);
  let mut pool = BlockPool::new(our_height, refuse_list.clone());
  for (peer, height) in known_peer_heights {
    pool.report_peer_height(peer.clone(), *height);
  }
  pool
}

/// Drains every height the fast-sync pool has buffered and is ready to
/// apply, lagging its commit persistence by one block: a block's own
/// `H/commit` record is only known once its successor arrives with a
/// real `last_commit`, so it's saved when that successor is applied,
/// not when the block itself is.
async fn drain_fast_sync(
  pool: &mut BlockPool,
  engine: &mut Engine,
  mempool: &Arc<TokioMutex<Mempool>>,
  last_applied: &mut Option<(Block, Vec<Part>)>,
) {
  while let Some((block, served_by)) = pool.pop_ready() {
    let height = block.header.height;
    let applied = {
      let mut mp = mempool.lock().await;
      engine.apply_block(&block, 0, &mut *mp)
    };
    match applied {
      Ok(()) => {
        if let Some((prev_block, prev_parts)) = last_applied.take() {
          if let Err(e) = engine.blocks().save_block(&prev_block, &prev_parts, &block.last_commit) {
            warn!("failed to persist fast-synced block {}: {e}", prev_block.header.height);
          }
        }
        let block_bytes = wire::encode_binary(&block).expect("block encodes");
        let parts = PartSet::from_block_bytes(&block_bytes).into_parts();
        *last_applied = Some((block, parts));
        pool.advance(height);
      }
      Err(e) => {
        warn!("fast-synced block {height} from {served_by} failed validation: {e}; banning peer");
        pool.punish(&served_by);
        break;
      }
    }
  }
}

/// Drafts, signs and gossips this node's own proposal if the driver's
/// current round actually belongs to it and it hasn't already done so
/// this round, then feeds the proposal back through the driver exactly
/// like an incoming one.
async fn maybe_propose(
  driver: &mut ConsensusDriver,
  engine: &mut Engine,
  network: &Network,
  mempool: &Arc<TokioMutex<Mempool>>,
  chain_id: &str,
  proposed_for: &mut Option<(u64, u32)>,
) -> Vec<DriverOutput> {
  let height = driver.height();
  let round = driver.current_round();
  if !driver.is_proposer() || *proposed_for == Some((height, round)) {
    return Vec::new();
  }

  let state = match engine.state_store().load() {
    Ok(Some(state)) => state,
    _ => return Vec::new(),
  };
  *proposed_for = Some((height, round));

  let last_commit = engine
    .blocks()
    .load_seen_commit(state.last_block_height)
    .ok()
    .flatten()
    .unwrap_or_else(Commit::empty);

  let block = {
    let mp = mempool.lock().await;
    engine.draft_block(
      chain_id,
      height,
      round,
      state.last_block_id.clone(),
      last_commit,
      &state.validators,
      state.app_hash.clone(),
      &mp,
    )
  };

  let block_bytes = wire::encode_binary(&block).expect("block encodes");
  let header = PartSet::from_block_bytes(&block_bytes).header;
  let proposal = Proposal {
    height,
    round,
    block_parts_header: header,
    pol_round: -1,
    pol_block_id: BlockId::nil(),
    signature: None,
  };
  let proposal = driver.sign_proposal(proposal);

  if let Err(e) = network.gossip_proposal(proposal.clone()) {
    warn!("failed to gossip own proposal: {e}");
  }
  if let Err(e) = network.gossip_block(block.clone()) {
    warn!("failed to gossip own block: {e}");
  }

  driver.propose_own_block(proposal, block)
}

/// Builds a fresh [`ConsensusDriver`] for `height`, immediately trying
/// to propose in case this node is already the round-0 proposer.
async fn start_height(
  height: u64,
  pv: crate::consensus::PrivValidator,
  engine: &mut Engine,
  network: &Network,
  mempool: &Arc<TokioMutex<Mempool>>,
  chain_id: &str,
  proposed_for: &mut Option<(u64, u32)>,
) -> (ConsensusDriver, VecDeque<DriverOutput>) {
  let validators: ValidatorSet = engine
    .state_store()
    .load()
    .ok()
    .flatten()
    .map(|state| state.validators)
    .expect("chain state must be seeded before consensus can start");

  let (mut driver, outs) =
    ConsensusDriver::new(height, chain_id.to_string(), pv, validators, TimeoutConfig::default());
  let mut queue: VecDeque<DriverOutput> = outs.into();
  queue.extend(maybe_propose(&mut driver, engine, network, mempool, chain_id, proposed_for).await);
  (driver, queue)
}

/// Processes a driver's outputs to completion: gossiping votes,
/// arming the single tracked timeout, and — on commit — persisting
/// the block, resolving RPC commit-waiters and spinning up the next
/// height's driver (or falling back to fast-sync if the commit
/// couldn't be applied locally, or was never received at all).
#[allow(clippy::too_many_arguments)]
async fn pump(
  mut queue: VecDeque<DriverOutput>,
  mode: &mut Mode,
  engine: &mut Engine,
  network: &Network,
  mempool: &Arc<TokioMutex<Mempool>>,
  chain_state: &rpc::SharedChainState,
  chain_id: &str,
  refuse_list: &RefuseList,
  pending_timeout: &mut Option<(Instant, Step, u32)>,
  proposed_for: &mut Option<(u64, u32)>,
  known_peer_heights: &HashMap<Pubkey, u64>,
  parked_priv_validator: &mut Option<crate::consensus::PrivValidator>,
) {
  while let Some(output) = queue.pop_front() {
    match output {
      DriverOutput::GossipVote(vote) => {
        if let Err(e) = network.gossip_vote(vote) {
          warn!("failed to gossip vote: {e}");
        }
      }
      DriverOutput::ScheduleTimeout { step, round, after } => {
        *pending_timeout = Some((Instant::now() + after, step, round));
      }
      DriverOutput::Commit { block, round, commit } => {
        let driver =
          match std::mem::replace(mode, Mode::FastSync(BlockPool::new(0, refuse_list.clone()))) {
            Mode::Consensus(driver) => driver,
            other @ Mode::FastSync(_) => {
              *mode = other;
              continue;
            }
          };
        let pv = driver.into_priv_validator();

        match block {
          Some(block) => {
            let height = block.header.height;
            let txs = block.data.txs.clone();
            let block_bytes = wire::encode_binary(&block).expect("block encodes");
            let parts = PartSet::from_block_bytes(&block_bytes).into_parts();

            let applied = {
              let mut mp = mempool.lock().await;
              engine.apply_block(&block, round, &mut *mp)
            };

            match applied {
              Ok(()) => {
                if let Err(e) = engine.blocks().save_block(&block, &parts, &commit) {
                  warn!("failed to persist committed block {height}: {e}");
                }
                chain_state.resolve_commits(&txs, height);
                chain_state.height.store(height, Ordering::Relaxed);
                network.set_height(height);

                match engine.state_store().load() {
                  Ok(Some(state)) => {
                    *chain_state.validators.lock().expect("validators lock poisoned") =
                      state.validators;
                    let (driver, outs) = start_height(
                      height + 1,
                      pv,
                      engine,
                      network,
                      mempool,
                      chain_id,
                      proposed_for,
                    )
                    .await;
                    *mode = Mode::Consensus(driver);
                    queue.extend(outs);
                  }
                  _ => {
                    error!("chain state missing right after a successful commit at height {height}");
                    *parked_priv_validator = Some(pv);
                    *mode = Mode::FastSync(build_fallback_pool(engine, refuse_list, known_peer_heights));
                  }
                }
              }
              Err(e) => {
                error!(
                  "rejected our own committed block at height {height}: {e}; falling back to fast-sync"
                );
                *parked_priv_validator = Some(pv);
                *mode = Mode::FastSync(build_fallback_pool(engine, refuse_list, known_peer_heights));
              }
            }
          }
          None => {
            warn!(round, "committed to a block this node never received; falling back to fast-sync");
            *parked_priv_validator = Some(pv);
            *mode = Mode::FastSync(build_fallback_pool(engine, refuse_list, known_peer_heights));
          }
        }
      }
    }
  }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
  let opts = CliOpts::parse();

  let loglevel = match opts.verbose {
    1 => Level::DEBUG,
    n if n >= 2 => Level::TRACE,
    _ => Level::INFO,
  };
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .with_filter(tracing_subscriber::filter::LevelFilter::from_level(loglevel)),
    )
    .init();

  let config = opts.load_config()?;
  info!(
    chain_id = %config.chain_id,
    moniker = %config.moniker,
    node_laddr = %config.node_laddr,
    "starting validator node"
  );

  let genesis = config.load_genesis()?;
  let priv_validator = config.load_or_generate_priv_validator()?;
  let addrbook = config.load_addrbook()?;

  let store = Store::open(&config.db_dir)?;
  let refuse_list = store.refuse_list();

  if store.state().load()?.is_none() {
    let validators = genesis.validator_set(true)?;
    let genesis_state = StoredState {
      chain_id: genesis.chain_id.clone(),
      last_block_height: 0,
      last_block_id: BlockId::nil(),
      last_block_time: genesis.genesis_time,
      validators: validators.clone(),
      last_validators: validators,
      app_hash: hex_decode(&genesis.app_hash),
      plugins: genesis.plugins.clone(),
    };
    store.state().save(&genesis_state)?;
    info!(chain_id = %genesis.chain_id, "seeded genesis state");
  }

  // No premined balances: the genesis document carries no account
  // table, only the validator set and app hash.
  let app = app::KvApp::new(HashMap::new());
  let accounts = app.view();
  let specialop = plugin::SharedSpecialop::new();
  let plugins: Vec<Box<dyn Plugin>> = genesis
    .plugins
    .iter()
    .filter_map(|name| match name.as_str() {
      "specialop" => Some(Box::new(specialop.clone()) as Box<dyn Plugin>),
      other => {
        warn!(plugin = other, "unrecognized plugin named in genesis; skipping");
        None
      }
    })
    .collect();

  let mut engine = Engine::connect_app(store, Box::new(app), plugins);
  engine.recover_from_crash()?;

  let state = engine.state_store().load()?.expect("state seeded above");

  let ca_validators: HashSet<Pubkey> =
    state.validators.validators.iter().filter(|v| v.is_ca).map(|v| v.pub_key.clone()).collect();

  let own_pubkey = priv_validator.pubkey();
  if !ca_validators.contains(&own_pubkey) {
    warn!(
      "this node is not itself a CA validator; its self-signed admission certificate will be \
       rejected by peers enforcing CA-gated admission"
    );
  }
  let mut cert_message = own_pubkey.as_bytes().to_vec();
  cert_message.extend_from_slice(config.chain_id.as_bytes());
  let certificate = PeerCertificate {
    ca_signer: own_pubkey.clone(),
    signature: priv_validator.sign_raw(&cert_message),
  };

  let authorizer = {
    let refuse_list = refuse_list.clone();
    Arc::new(PeerAuthorizer::new(ca_validators, config.chain_id.clone(), move |pk: &Pubkey| {
      refuse_list.contains(pk).unwrap_or(false)
    }))
  };

  let network =
    Network::bind(config.node_laddr, priv_validator.keypair(), certificate, authorizer).await?;
  network.set_height(state.last_block_height);

  for addr in config.seed_addrs() {
    if let Err(e) = network.dial(addr) {
      warn!("failed to dial seed {addr}: {e}");
    }
  }
  for addr in addrbook.dialable(config.addrbook_strict) {
    if let Err(e) = network.dial(addr) {
      warn!("failed to dial addrbook peer {addr}: {e}");
    }
  }

  let mempool = Arc::new(TokioMutex::new(Mempool::new()));

  let chain_state = rpc::SharedChainState::new(
    config.chain_id.clone(),
    config.moniker.clone(),
    state.validators.clone(),
    engine.blocks(),
    accounts,
    specialop,
    mempool.clone(),
    network.handle(),
  );
  rpc::serve(config.rpc_laddrs(), chain_state.clone());

  let mut priv_validator: Option<crate::consensus::PrivValidator> = Some(priv_validator);
  let mut pending_timeout: Option<(Instant, Step, u32)> = None;
  let mut proposed_for: Option<(u64, u32)> = None;
  let mut known_peer_heights: HashMap<Pubkey, u64> = HashMap::new();
  let mut last_applied: Option<(Block, Vec<Part>)> = None;
  let mut caught_up_height: Option<u64> = None;

  let mut mode = if config.fast_sync {
    Mode::FastSync(BlockPool::new(state.last_block_height, refuse_list.clone()))
  } else {
    let pv = priv_validator.take().expect("just parked above");
    let (driver, outs) = start_height(
      state.last_block_height + 1,
      pv,
      &mut engine,
      &network,
      &mempool,
      &config.chain_id,
      &mut proposed_for,
    )
    .await;
    let mut mode = Mode::Consensus(driver);
    pump(
      outs,
      &mut mode,
      &mut engine,
      &network,
      &mempool,
      &chain_state,
      &config.chain_id,
      &refuse_list,
      &mut pending_timeout,
      &mut proposed_for,
      &known_peer_heights,
      &mut priv_validator,
    )
    .await;
    mode
  };

  let mut fast_sync_tick = tokio::time::interval(Duration::from_millis(500));

  loop {
    tokio::select! {
      maybe_event = network.poll() => {
        let event = match maybe_event {
          Some(event) => event,
          None => return Ok(()),
        };
        match event {
          NetworkEvent::PeerConnected { peer, height } => {
            known_peer_heights.insert(peer.clone(), height);
            chain_state.peer_count.store(known_peer_heights.len(), Ordering::Relaxed);
            if let Mode::FastSync(pool) = &mut mode {
              pool.report_peer_height(peer, height);
              issue_requests(pool, &network);
            }
          }
          NetworkEvent::PeerDisconnected(peer) => {
            known_peer_heights.remove(&peer);
            chain_state.peer_count.store(known_peer_heights.len(), Ordering::Relaxed);
            if let Mode::FastSync(pool) = &mut mode {
              pool.peer_disconnected(&peer);
            }
          }
          NetworkEvent::TxReceived(tx) => {
            let mut mp = mempool.lock().await;
            if let Err(reason) = mp.check_tx(tx) {
              debug!(%reason, "rejected gossiped tx");
            }
          }
          NetworkEvent::VoteReceived(vote) => {
            if let Mode::Consensus(driver) = &mut mode {
              match driver.receive_vote(vote) {
                Ok(outs) => {
                  pump(
                    outs.into(), &mut mode, &mut engine, &network, &mempool, &chain_state,
                    &config.chain_id, &refuse_list, &mut pending_timeout, &mut proposed_for,
                    &known_peer_heights, &mut priv_validator,
                  ).await;
                }
                Err(e) => warn!("dropping bad vote: {e}"),
              }
            }
          }
          NetworkEvent::ProposalReceived(proposal) => {
            if let Mode::Consensus(driver) = &mut mode {
              let outs = driver.receive_proposal(proposal);
              pump(
                outs.into(), &mut mode, &mut engine, &network, &mempool, &chain_state,
                &config.chain_id, &refuse_list, &mut pending_timeout, &mut proposed_for,
                &known_peer_heights, &mut priv_validator,
              ).await;
            }
          }
          NetworkEvent::BlockReceived { from, block } => {
            match &mut mode {
              Mode::Consensus(driver) => {
                let outs = driver.receive_block(block);
                pump(
                  outs.into(), &mut mode, &mut engine, &network, &mempool, &chain_state,
                  &config.chain_id, &refuse_list, &mut pending_timeout, &mut proposed_for,
                  &known_peer_heights, &mut priv_validator,
                ).await;
              }
              Mode::FastSync(pool) => {
                pool.receive_block(from, block);
                drain_fast_sync(pool, &mut engine, &mempool, &mut last_applied).await;
                issue_requests(pool, &network);
                if pool.is_caught_up() {
                  caught_up_height = Some(pool.our_height() + 1);
                }
              }
            }
          }
          NetworkEvent::BlockRequested { from, height } => {
            match engine.blocks().load_block(height) {
              Ok(Some(block)) => {
                if let Err(e) = network.send_block(from, block) {
                  warn!("failed to reply to block request: {e}");
                }
              }
              Ok(None) => debug!(height, "ignoring request for a block we don't have"),
              Err(e) => warn!("failed to load block {height} for request: {e}"),
            }
          }
        }
      }

      _ = fast_sync_tick.tick() => {
        if let Mode::FastSync(pool) = &mut mode {
          issue_requests(pool, &network);
          while let Some(height) = pool.retry_stream().next().now_or_never().flatten() {
            if let Some(req) = pool.reassign(height) {
              if let Err(e) = network.request_block(req.peer, req.height) {
                warn!("failed to re-request block {}: {e}", req.height);
              }
            }
          }
        }
      }

      _ = tokio::time::sleep_until(pending_timeout.map(|(at, ..)| at).unwrap_or_else(Instant::now)), if pending_timeout.is_some() => {
        if let Some((_, step, round)) = pending_timeout.take() {
          if let Mode::Consensus(driver) = &mut mode {
            let outs = match step {
              Step::Propose => driver.propose_timed_out(),
              Step::PrevoteWait => driver.prevote_wait_timed_out(round),
              Step::PrecommitWait => driver.precommit_wait_timed_out(round),
            };
            pump(
              outs.into(), &mut mode, &mut engine, &network, &mempool, &chain_state,
              &config.chain_id, &refuse_list, &mut pending_timeout, &mut proposed_for,
              &known_peer_heights, &mut priv_validator,
            ).await;
          }
        }
      }
    }

    if let Some(height) = caught_up_height.take() {
      if let Some(pv) = priv_validator.take() {
        info!(height, "fast-sync caught up; switching to live consensus");
        let (driver, outs) = start_height(
          height, pv, &mut engine, &network, &mempool, &config.chain_id, &mut proposed_for,
        )
        .await;
        mode = Mode::Consensus(driver);
        pump(
          outs, &mut mode, &mut engine, &network, &mempool, &chain_state,
          &config.chain_id, &refuse_list, &mut pending_timeout, &mut proposed_for,
          &known_peer_heights, &mut priv_validator,
        )
        .await;
      }
    }
  }
}
