//! The P2P switch (base spec §4.2): a reactor-based multiplexer over
//! authenticated TCP connections. Where the teacher gossiped whole
//! blocks over `libp2p`/episub, this engine needs permissioned,
//! CA-gated admission and byte-typed reactor channels instead of open
//! topic subscription, so the transport is a hand-rolled TCP
//! multiplexer over [`secret_connection::SecretConnection`].

mod addrbook;
pub mod blockchain;
mod responder;
mod secret_connection;

pub use addrbook::{AddrBook, AddrBookError, KnownPeer};
pub use blockchain::{BlockPool, BlockRequest};
pub use responder::SwarmResponder;
use secret_connection::SecretConnection;

use {
  crate::{
    consensus::{Block, Proposal, Tx, Vote},
    primitives::{Keypair, Pubkey, Signature},
  },
  dashmap::DashMap,
  serde::{Deserialize, Serialize},
  std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{
      atomic::{AtomicU64, Ordering},
      Arc,
    },
  },
  tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
  },
  tracing::{debug, error, warn},
};

/// Reactor channel identifiers (base spec §4.2 "Wire protocol").
/// The spec's own channel table overlaps `PEX` and the `CONSENSUS`
/// range at `0x20`; this resolves that by giving each reactor a
/// disjoint id while keeping the spec's PEX/MEMPOOL/BLOCKCHAIN values.
pub mod channel {
  pub const PEX: u8 = 0x20;
  pub const MEMPOOL: u8 = 0x30;
  pub const BLOCKCHAIN: u8 = 0x40;
  pub const CONSENSUS_STATE: u8 = 0x50;
  pub const CONSENSUS_DATA: u8 = 0x51;
  pub const CONSENSUS_VOTE: u8 = 0x52;
}

#[derive(Debug, Clone)]
pub struct Frame {
  pub channel_id: u8,
  pub payload: Vec<u8>,
}

/// Carried on [`channel::BLOCKCHAIN`]: either a request for a block at
/// a given height, or the block itself, served in reply (base spec
/// §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
enum BlockchainMsg {
  Request(u64),
  Block(Block),
}

#[derive(Debug, Clone)]
pub enum NetworkEvent {
  ProposalReceived(Proposal),
  VoteReceived(Vote),
  BlockReceived { from: Pubkey, block: Block },
  BlockRequested { from: Pubkey, height: u64 },
  TxReceived(Tx),
  /// Carries the peer's self-reported height from its [`NodeInfo`] so
  /// the fast-sync reactor can size its request window without a
  /// separate round-trip.
  PeerConnected { peer: Pubkey, height: u64 },
  PeerDisconnected(Pubkey),
}

#[derive(Debug, Clone)]
pub enum NetworkCommand {
  Dial(SocketAddr),
  GossipProposal(Proposal),
  GossipVote(Vote),
  GossipBlock(Block),
  GossipTx(Tx),
  RequestBlock { peer: Pubkey, height: u64 },
  SendBlock { peer: Pubkey, block: Block },
  Disconnect(Pubkey),
}

/// A CA-issued admission credential this node presents to peers at
/// handshake time: some `is_ca=true` validator's signature over this
/// node's own pubkey concatenated with the chain id (base spec §4.2
/// "Handshake" step (2)). Obtained out of band, e.g. via the
/// specialop channel, before the node ever dials or accepts a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerCertificate {
  pub ca_signer: Pubkey,
  pub signature: Signature,
}

/// Exchanged immediately after the AEAD handshake completes, before
/// either side enters the frame-dispatch loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeInfo {
  pub_key: Pubkey,
  certificate: PeerCertificate,
  height: u64,
}

/// The two admission predicates every inbound and outbound connection
/// must satisfy once the secret-connection handshake completes (base
/// spec §4.2 "Handshake" steps (1)-(2)).
pub struct PeerAuthorizer {
  ca_validators: HashSet<Pubkey>,
  chain_id: String,
  refused: Arc<dyn Fn(&Pubkey) -> bool + Send + Sync>,
}

impl PeerAuthorizer {
  pub fn new(
    ca_validators: HashSet<Pubkey>,
    chain_id: String,
    refused: impl Fn(&Pubkey) -> bool + Send + Sync + 'static,
  ) -> Self {
    Self { ca_validators, chain_id, refused: Arc::new(refused) }
  }

  /// `signature` must verify as `peer_pub_key ‖ chain_id` signed by
  /// some `is_ca=true` validator (base spec §4.2 CA filter).
  pub fn authorize(
    &self,
    peer_pub_key: &Pubkey,
    signer: &Pubkey,
    signature: &Signature,
  ) -> bool {
    if (self.refused)(peer_pub_key) {
      return false;
    }
    if !self.ca_validators.contains(signer) {
      return false;
    }
    let mut message = peer_pub_key.as_bytes().to_vec();
    message.extend_from_slice(self.chain_id.as_bytes());
    signature.verify(signer, &message)
  }
}

/// Shared state every accept/dial/command task needs a handle to:
/// this node's own identity and admission credential, the predicate
/// that gates everyone else's, the live outbound connection table,
/// and the event sink frames get dispatched onto.
struct Switch {
  identity: Keypair,
  certificate: PeerCertificate,
  authorizer: Arc<PeerAuthorizer>,
  peers: DashMap<Pubkey, UnboundedSender<Frame>>,
  events: UnboundedSender<NetworkEvent>,
  height: AtomicU64,
}

/// A cheaply-cloned handle onto the outbound command queue, shared
/// with the RPC layer so `POST /broadcast_tx_*` can gossip a tx
/// directly without round-tripping through the main select loop.
#[derive(Clone)]
pub struct NetworkHandle {
  netout: UnboundedSender<NetworkCommand>,
}

impl NetworkHandle {
  pub fn gossip_vote(&self, vote: Vote) -> Result<(), String> {
    self.netout.send(NetworkCommand::GossipVote(vote)).map_err(|e| e.to_string())
  }

  pub fn gossip_proposal(&self, proposal: Proposal) -> Result<(), String> {
    self
      .netout
      .send(NetworkCommand::GossipProposal(proposal))
      .map_err(|e| e.to_string())
  }

  pub fn gossip_block(&self, block: Block) -> Result<(), String> {
    self.netout.send(NetworkCommand::GossipBlock(block)).map_err(|e| e.to_string())
  }

  pub fn gossip_tx(&self, tx: Tx) -> Result<(), String> {
    self.netout.send(NetworkCommand::GossipTx(tx)).map_err(|e| e.to_string())
  }

  pub fn request_block(&self, peer: Pubkey, height: u64) -> Result<(), String> {
    self
      .netout
      .send(NetworkCommand::RequestBlock { peer, height })
      .map_err(|e| e.to_string())
  }

  pub fn send_block(&self, peer: Pubkey, block: Block) -> Result<(), String> {
    self.netout.send(NetworkCommand::SendBlock { peer, block }).map_err(|e| e.to_string())
  }

  pub fn dial(&self, addr: SocketAddr) -> Result<(), String> {
    self.netout.send(NetworkCommand::Dial(addr)).map_err(|e| e.to_string())
  }

  pub fn disconnect(&self, peer: Pubkey) -> Result<(), String> {
    self.netout.send(NetworkCommand::Disconnect(peer)).map_err(|e| e.to_string())
  }
}

/// Drives TCP accept/dial loops and fans decoded frames out as
/// [`NetworkEvent`]s, mirroring the teacher's channel-pair façade
/// (`Network::poll`/`Network::gossip_*`) over an entirely different
/// transport underneath.
pub struct Network {
  netin: UnboundedReceiver<NetworkEvent>,
  netout: UnboundedSender<NetworkCommand>,
  switch: Arc<Switch>,
}

impl Network {
  pub async fn bind(
    listen_addr: SocketAddr,
    identity: Keypair,
    certificate: PeerCertificate,
    authorizer: Arc<PeerAuthorizer>,
  ) -> std::io::Result<Self> {
    let listener = TcpListener::bind(listen_addr).await?;
    let (netin_tx, netin_rx) = unbounded_channel();
    let (netout_tx, mut netout_rx) = unbounded_channel::<NetworkCommand>();

    let switch = Arc::new(Switch {
      identity,
      certificate,
      authorizer,
      peers: DashMap::new(),
      events: netin_tx,
      height: AtomicU64::new(0),
    });

    let accept_switch = switch.clone();
    tokio::spawn(async move {
      loop {
        tokio::select! {
          accepted = listener.accept() => {
            match accepted {
              Ok((stream, addr)) => {
                debug!("accepted inbound connection from {addr}");
                tokio::spawn(admit_connection(stream, false, accept_switch.clone()));
              }
              Err(e) => error!("accept failed: {e}"),
            }
          },
          Some(cmd) = netout_rx.recv() => {
            handle_command(cmd, accept_switch.clone());
          }
        }
      }
    });

    Ok(Self { netin: netin_rx, netout: netout_tx, switch })
  }

  /// Updates the height this node advertises to newly admitted peers
  /// (used by the fast-sync reactor to size its request window).
  pub fn set_height(&self, height: u64) {
    self.switch.height.store(height, Ordering::Relaxed);
  }

  pub fn dial(&self, addr: SocketAddr) -> Result<(), String> {
    self.netout.send(NetworkCommand::Dial(addr)).map_err(|e| e.to_string())
  }

  pub fn gossip_vote(&self, vote: Vote) -> Result<(), String> {
    self.netout.send(NetworkCommand::GossipVote(vote)).map_err(|e| e.to_string())
  }

  pub fn gossip_proposal(&self, proposal: Proposal) -> Result<(), String> {
    self
      .netout
      .send(NetworkCommand::GossipProposal(proposal))
      .map_err(|e| e.to_string())
  }

  pub fn gossip_block(&self, block: Block) -> Result<(), String> {
    self.netout.send(NetworkCommand::GossipBlock(block)).map_err(|e| e.to_string())
  }

  pub fn gossip_tx(&self, tx: Tx) -> Result<(), String> {
    self.netout.send(NetworkCommand::GossipTx(tx)).map_err(|e| e.to_string())
  }

  pub fn request_block(&self, peer: Pubkey, height: u64) -> Result<(), String> {
    self
      .netout
      .send(NetworkCommand::RequestBlock { peer, height })
      .map_err(|e| e.to_string())
  }

  pub fn send_block(&self, peer: Pubkey, block: Block) -> Result<(), String> {
    self.netout.send(NetworkCommand::SendBlock { peer, block }).map_err(|e| e.to_string())
  }

  pub fn disconnect(&self, peer: Pubkey) -> Result<(), String> {
    self.netout.send(NetworkCommand::Disconnect(peer)).map_err(|e| e.to_string())
  }

  /// A cloneable handle onto the outbound command queue, for callers
  /// that need to gossip without owning the event half of `Network`
  /// (e.g. the RPC layer admitting a tx).
  pub fn handle(&self) -> NetworkHandle {
    NetworkHandle { netout: self.netout.clone() }
  }

  pub async fn poll(&mut self) -> Option<NetworkEvent> {
    self.netin.recv().await
  }
}

/// Runs the AEAD handshake, exchanges [`NodeInfo`], and — only once
/// `authorizer.authorize` accepts the peer's CA certificate — splits
/// the connection into a reader task and a per-peer send queue
/// registered in `switch.peers` (base spec §4.2 "Handshake" steps
/// (1)-(3)). Unauthorized peers are simply dropped once the exchange
/// completes; they never reach `dispatch_frame`.
async fn admit_connection(
  stream: TcpStream,
  initiator: bool,
  switch: Arc<Switch>,
) -> Result<(), secret_connection::HandshakeError> {
  let mut conn = SecretConnection::handshake(stream, initiator).await?;

  let own_info = NodeInfo {
    pub_key: switch.identity.public(),
    certificate: switch.certificate.clone(),
    height: switch.height.load(Ordering::Relaxed),
  };
  let own_bytes = bincode::serialize(&own_info).expect("node info encodes");

  let peer_bytes = if initiator {
    conn.send_frame(&own_bytes).await?;
    conn.recv_frame().await?
  } else {
    let peer_bytes = conn.recv_frame().await?;
    conn.send_frame(&own_bytes).await?;
    peer_bytes
  };

  let peer: NodeInfo = bincode::deserialize(&peer_bytes)
    .map_err(|_| secret_connection::HandshakeError::DecryptionFailed)?;

  if !switch.authorizer.authorize(
    &peer.pub_key,
    &peer.certificate.ca_signer,
    &peer.certificate.signature,
  ) {
    warn!(peer = %peer.pub_key, "peer failed CA admission check, dropping connection");
    return Ok(());
  }

  let (mut reader, mut writer) = conn.split();
  let (tx, mut rx) = unbounded_channel::<Frame>();
  switch.peers.insert(peer.pub_key.clone(), tx);
  let _ = switch
    .events
    .send(NetworkEvent::PeerConnected { peer: peer.pub_key.clone(), height: peer.height });

  let writer_switch = switch.clone();
  let writer_peer = peer.pub_key.clone();
  tokio::spawn(async move {
    while let Some(frame) = rx.recv().await {
      let mut bytes = Vec::with_capacity(1 + frame.payload.len());
      bytes.push(frame.channel_id);
      bytes.extend_from_slice(&frame.payload);
      if writer.send_frame(&bytes).await.is_err() {
        break;
      }
    }
    writer_switch.peers.remove(&writer_peer);
  });

  let reader_switch = switch.clone();
  let reader_peer = peer.pub_key.clone();
  tokio::spawn(async move {
    loop {
      match reader.recv_frame().await {
        Ok(payload) => dispatch_frame(&payload, &reader_peer, &reader_switch.events),
        Err(_) => break,
      }
    }
    reader_switch.peers.remove(&reader_peer);
    let _ = reader_switch.events.send(NetworkEvent::PeerDisconnected(reader_peer));
  });

  Ok(())
}

fn dispatch_frame(payload: &[u8], from: &Pubkey, events: &UnboundedSender<NetworkEvent>) {
  // The leading byte is the channel id (base spec §4.2 `{channel_id,
  // payload}`); the remainder decodes per-channel.
  let (&channel_id, body) = match payload.split_first() {
    Some(split) => split,
    None => return,
  };
  let event = match channel_id {
    channel::CONSENSUS_VOTE => bincode::deserialize(body).ok().map(NetworkEvent::VoteReceived),
    channel::CONSENSUS_DATA => {
      bincode::deserialize(body).ok().map(NetworkEvent::ProposalReceived)
    }
    channel::BLOCKCHAIN => {
      bincode::deserialize::<BlockchainMsg>(body).ok().map(|msg| match msg {
        BlockchainMsg::Request(height) => {
          NetworkEvent::BlockRequested { from: from.clone(), height }
        }
        BlockchainMsg::Block(block) => NetworkEvent::BlockReceived { from: from.clone(), block },
      })
    }
    channel::MEMPOOL => bincode::deserialize(body).ok().map(NetworkEvent::TxReceived),
    _ => None,
  };
  if let Some(event) = event {
    let _ = events.send(event);
  }
}

fn send_frame_to(switch: &Switch, peer: &Pubkey, channel_id: u8, payload: Vec<u8>) {
  if let Some(sender) = switch.peers.get(peer) {
    let _ = sender.send(Frame { channel_id, payload });
  }
}

fn broadcast(switch: &Switch, channel_id: u8, payload: Vec<u8>) {
  for entry in switch.peers.iter() {
    let _ = entry.value().send(Frame { channel_id, payload: payload.clone() });
  }
}

fn handle_command(cmd: NetworkCommand, switch: Arc<Switch>) {
  match cmd {
    NetworkCommand::Dial(addr) => {
      let switch = switch.clone();
      tokio::spawn(async move {
        match TcpStream::connect(addr).await {
          Ok(stream) => {
            if let Err(e) = admit_connection(stream, true, switch).await {
              warn!("outbound handshake with {addr} failed: {e}");
            }
          }
          Err(e) => warn!("dial {addr} failed: {e}"),
        }
      });
    }
    NetworkCommand::GossipVote(vote) => match bincode::serialize(&vote) {
      Ok(payload) => broadcast(&switch, channel::CONSENSUS_VOTE, payload),
      Err(e) => warn!("failed to encode vote for gossip: {e}"),
    },
    NetworkCommand::GossipProposal(proposal) => match bincode::serialize(&proposal) {
      Ok(payload) => broadcast(&switch, channel::CONSENSUS_DATA, payload),
      Err(e) => warn!("failed to encode proposal for gossip: {e}"),
    },
    NetworkCommand::GossipBlock(block) => {
      match bincode::serialize(&BlockchainMsg::Block(block)) {
        Ok(payload) => broadcast(&switch, channel::BLOCKCHAIN, payload),
        Err(e) => warn!("failed to encode block for gossip: {e}"),
      }
    }
    NetworkCommand::GossipTx(tx) => match bincode::serialize(&tx) {
      Ok(payload) => broadcast(&switch, channel::MEMPOOL, payload),
      Err(e) => warn!("failed to encode tx for gossip: {e}"),
    },
    NetworkCommand::RequestBlock { peer, height } => {
      match bincode::serialize(&BlockchainMsg::Request(height)) {
        Ok(payload) => send_frame_to(&switch, &peer, channel::BLOCKCHAIN, payload),
        Err(e) => warn!("failed to encode block request: {e}"),
      }
    }
    NetworkCommand::SendBlock { peer, block } => {
      match bincode::serialize(&BlockchainMsg::Block(block)) {
        Ok(payload) => send_frame_to(&switch, &peer, channel::BLOCKCHAIN, payload),
        Err(e) => warn!("failed to encode block reply: {e}"),
      }
    }
    NetworkCommand::Disconnect(pk) => {
      switch.peers.remove(&pk);
      debug!("disconnected {pk}");
    }
  }
}
