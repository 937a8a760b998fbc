//! The process-scoped `IpfsDevice`: a libp2p `Swarm` combining Kademlia peer discovery, mDNS for
//! local peers, and the first-party Bitswap-shaped block exchange protocol, driven by a background
//! task and controlled through a small command channel (transport via noise+yamux over TCP, a
//! single combined behaviour, a named executor spawning onto the shared runtime).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use futures::StreamExt;
use libp2p::kad::{self, store::MemoryStore};
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{identify, identity, mdns, noise, ping, tcp, yamux, PeerId, Swarm};
use tokio::sync::{mpsc, oneshot};

use bitswap::{BitswapError, BitswapRequest, BitswapResponse};

use crate::config::FetchCoreConfig;

/// The peer-discovery/block-fetch surface the retrieval engine needs. Kept as a trait (rather than
/// engine code taking `IpfsDevice` directly) so the engine's recursive walk can be driven against a
/// stub in tests, without a live libp2p `Swarm`.
#[async_trait]
pub trait PeerSource: Send + Sync {
    async fn find_providers(&self, cid: Cid) -> Vec<PeerId>;
    async fn request_block(&self, peer: PeerId, cid: Cid) -> Result<Vec<u8>, BitswapError>;
}

const BITSWAP_PROTOCOL_VERSION: &str = "fetch-core/0.1.0";

#[derive(NetworkBehaviour)]
pub struct FetchBehaviour {
    kad: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
    mdns: mdns::tokio::Behaviour,
    ping: ping::Behaviour,
    bitswap: bitswap::BitswapBehaviour,
}

enum Command {
    FindProviders {
        cid: Cid,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    RequestBlock {
        peer: PeerId,
        cid: Cid,
        reply: oneshot::Sender<Result<Vec<u8>, BitswapError>>,
    },
}

/// A handle to the background swarm-driving task. Cheap to clone; all state lives in the task.
#[derive(Clone)]
pub struct IpfsDevice {
    commands: mpsc::UnboundedSender<Command>,
}

impl IpfsDevice {
    pub async fn new(config: &FetchCoreConfig) -> Self {
        let keypair = identity::Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(keypair.public());

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .expect("tcp transport with noise+yamux never fails to construct")
            .with_behaviour(|key| {
                let mut kad_config = kad::Config::default();
                kad_config.set_query_timeout(config.dht_retry_deadline);
                let kad = kad::Behaviour::with_config(
                    local_peer_id,
                    MemoryStore::new(local_peer_id),
                    kad_config,
                );

                let identify = identify::Behaviour::new(identify::Config::new(
                    BITSWAP_PROTOCOL_VERSION.to_owned(),
                    key.public(),
                ));

                let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)
                    .expect("mdns behaviour construction is infallible on supported platforms");

                let ping = ping::Behaviour::default();
                let bitswap = bitswap::behaviour();

                FetchBehaviour {
                    kad,
                    identify,
                    mdns,
                    ping,
                    bitswap,
                }
            })
            .expect("behaviour closure never returns an error")
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let listen_addr = config
            .listen_addr
            .parse()
            .unwrap_or_else(|_| "/ip4/0.0.0.0/tcp/0".parse().unwrap());
        Swarm::listen_on(&mut swarm, listen_addr).expect("listening on configured address");

        swarm
            .behaviour_mut()
            .kad
            .set_mode(Some(kad::Mode::Client));

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(swarm, rx));

        IpfsDevice { commands: tx }
    }
}

#[async_trait]
impl PeerSource for IpfsDevice {
    /// Runs `dht.FindProviders(cid)` once and returns whatever providers came back (possibly
    /// empty). Retry/backoff is the caller's responsibility (see the retrieval engine's
    /// `start_finding_peers`), keeping a single DHT query separate from the retry timer wrapping it.
    async fn find_providers(&self, cid: Cid) -> Vec<PeerId> {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::FindProviders { cid, reply })
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Asks one peer for one block over the Bitswap-shaped protocol.
    async fn request_block(&self, peer: PeerId, cid: Cid) -> Result<Vec<u8>, BitswapError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::RequestBlock { peer, cid, reply })
            .map_err(|_| {
                BitswapError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "ipfs device task is gone",
                ))
            })?;
        rx.await.map_err(|_| {
            BitswapError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "ipfs device task dropped the reply channel",
            ))
        })?
    }
}

async fn run(mut swarm: Swarm<FetchBehaviour>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut pending_providers: HashMap<kad::QueryId, oneshot::Sender<Vec<PeerId>>> =
        HashMap::new();
    let mut pending_requests: HashMap<
        libp2p::request_response::OutboundRequestId,
        oneshot::Sender<Result<Vec<u8>, BitswapError>>,
    > = HashMap::new();

    loop {
        tokio::select! {
            Some(command) = commands.recv() => match command {
                Command::FindProviders { cid, reply } => {
                    let key = kad::RecordKey::new(&cid.to_bytes());
                    let query_id = swarm.behaviour_mut().kad.get_providers(key);
                    pending_providers.insert(query_id, reply);
                }
                Command::RequestBlock { peer, cid, reply } => {
                    let request_id = swarm
                        .behaviour_mut()
                        .bitswap
                        .send_request(&peer, BitswapRequest::for_cid(&cid));
                    pending_requests.insert(request_id, reply);
                }
            },
            event = swarm.select_next_some() => handle_event(
                &mut swarm,
                event,
                &mut pending_providers,
                &mut pending_requests,
            ),
            else => break,
        }
    }
}

fn handle_event(
    swarm: &mut Swarm<FetchBehaviour>,
    event: SwarmEvent<FetchBehaviourEvent>,
    pending_providers: &mut HashMap<kad::QueryId, oneshot::Sender<Vec<PeerId>>>,
    pending_requests: &mut HashMap<
        libp2p::request_response::OutboundRequestId,
        oneshot::Sender<Result<Vec<u8>, BitswapError>>,
    >,
) {
    match event {
        SwarmEvent::Behaviour(FetchBehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
            id,
            result: kad::QueryResult::GetProviders(result),
            ..
        })) => {
            if let Some(reply) = pending_providers.remove(&id) {
                let providers = match result {
                    Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                        providers.into_iter().collect()
                    }
                    _ => Vec::new(),
                };
                let _ = reply.send(providers);
            }
        }
        SwarmEvent::Behaviour(FetchBehaviourEvent::Bitswap(
            libp2p::request_response::Event::Message { message, .. },
        )) => {
            if let libp2p::request_response::Message::Response {
                request_id,
                response,
            } = message
            {
                if let Some(reply) = pending_requests.remove(&request_id) {
                    let outcome = match response {
                        BitswapResponse::Have { data } => Ok(data),
                        BitswapResponse::DontHave => Err(BitswapError::NotFound),
                    };
                    let _ = reply.send(outcome);
                }
            }
        }
        SwarmEvent::Behaviour(FetchBehaviourEvent::Bitswap(
            libp2p::request_response::Event::OutboundFailure { request_id, .. },
        )) => {
            if let Some(reply) = pending_requests.remove(&request_id) {
                let _ = reply.send(Err(BitswapError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "outbound bitswap request failed",
                ))));
            }
        }
        SwarmEvent::Behaviour(FetchBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
            for (peer_id, addr) in peers {
                swarm.behaviour_mut().kad.add_address(&peer_id, addr);
            }
        }
        _ => {}
    }
}
