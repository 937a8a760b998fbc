//! The recursive UnixFS DAG retrieval algorithm: peer discovery with a retry timer, an indexed
//! walk across candidate peers for each block, and per-request `CidInfo` aggregation that knows
//! when a root CID's fetch is complete. Each `load_async` call gets its own `CidInfo` — there is no
//! cross-request sharing, since a Tokio `await` chain already gives every request its own
//! continuation without needing a process-wide table keyed by root CID the way a callback-based
//! implementation would.

use std::convert::TryFrom;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cid::Cid;
use libp2p::PeerId;
use tokio::sync::Mutex;
use tokio::time::sleep;

use ipfs_unixfs::file::validate_file_or_raw;
use ipfs_unixfs::pb::FlatUnixFs;

use crate::config::FetchCoreConfig;
use crate::model::{ErrorMessage, ProgressTag, ResultBundle};
use crate::status::StatusSender;

use super::device::PeerSource;

#[derive(Debug, thiserror::Error)]
pub enum IpfsError {
    #[error("no providers found for {0} after exhausting retries")]
    DhtNoProviders(Cid),
    #[error("failed to decode block {0} as a UnixFS dag-pb node: {1}")]
    BitswapDecodeFailed(Cid, String),
    #[error("exhausted every candidate peer while fetching {0}")]
    BitswapExhausted(Cid),
}

impl From<IpfsError> for ErrorMessage {
    fn from(e: IpfsError) -> Self {
        ErrorMessage::new("ipfs", e.to_string())
    }
}

/// One chunk of a multi-block file, owned by exactly one root `CidInfo`.
struct LinkedCid {
    cid: Cid,
    #[allow(dead_code)] // retained for diagnostics only
    parent_cid: Cid,
    assigned_name: String,
    content: Option<Vec<u8>>,
}

/// Per-root-CID aggregation state. `outstanding_requests` reaches zero at most once; that
/// transition is guarded by `completed` so the completion path only ever runs a single time.
struct CidInfo {
    directories: Vec<String>,
    main_cids: Vec<Cid>,
    linked_cids: Vec<LinkedCid>,
    outstanding_requests: i64,
    final_contents: ResultBundle,
    completed: bool,
}

impl CidInfo {
    fn new() -> Self {
        CidInfo {
            directories: Vec::new(),
            main_cids: Vec::new(),
            linked_cids: Vec::new(),
            outstanding_requests: 0,
            final_contents: ResultBundle::empty(),
            completed: false,
        }
    }

    /// Concatenates every assembled file's chunks in discovery order and pushes the result into
    /// `final_contents` under its name.
    fn group_linked_cids(&mut self) {
        let mut by_name: Vec<(String, Vec<u8>)> = Vec::new();
        for linked in &self.linked_cids {
            let content = linked.content.clone().unwrap_or_default();
            match by_name.iter_mut().find(|(name, _)| *name == linked.assigned_name) {
                Some((_, bytes)) => bytes.extend_from_slice(&content),
                None => by_name.push((linked.assigned_name.clone(), content)),
            }
        }
        for (name, bytes) in by_name {
            self.final_contents.push(name, bytes);
        }
    }
}

/// Fetches the tree rooted at `root_cid`, starting with `filename` as the name assigned to the
/// root if it turns out to be a single leaf file.
pub async fn fetch(
    device: Arc<dyn PeerSource>,
    config: &FetchCoreConfig,
    root_cid: Cid,
    filename: String,
    status: StatusSender,
) -> Result<ResultBundle, ErrorMessage> {
    let peers = start_finding_peers(&device, config, root_cid, &status).await?;

    let info = Arc::new(Mutex::new(CidInfo::new()));
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let done_tx = Arc::new(Mutex::new(Some(done_tx)));

    let _ = status.send(Ok(ProgressTag("reading-blocks")));
    request_block_main(
        device,
        info,
        done_tx,
        status.clone(),
        peers,
        root_cid,
        filename,
    )
    .await;

    let bundle = done_rx
        .await
        .unwrap_or_else(|_| Err(IpfsError::BitswapExhausted(root_cid).into()))?;

    let _ = status.send(Ok(ProgressTag("completed")));
    Ok(bundle)
}

/// `StartFindingPeers`: queries the DHT once; on an empty result, waits `dht_retry_deadline` and
/// tries again, up to `config.dht_max_retries` times (`None` means unbounded retries).
async fn start_finding_peers(
    device: &Arc<dyn PeerSource>,
    config: &FetchCoreConfig,
    root_cid: Cid,
    status: &StatusSender,
) -> Result<Vec<PeerId>, ErrorMessage> {
    let _ = status.send(Ok(ProgressTag("finding-peers")));
    let mut attempt: u32 = 0;
    loop {
        let providers = device.find_providers(root_cid).await;
        if !providers.is_empty() {
            return Ok(providers);
        }

        attempt += 1;
        if let Some(max) = config.dht_max_retries {
            if attempt >= max {
                return Err(IpfsError::DhtNoProviders(root_cid).into());
            }
        }

        tracing::warn!(%root_cid, attempt, "no providers found, retrying after deadline");
        let _ = status.send(Ok(ProgressTag("no-providers-retry")));
        sleep(config.dht_retry_deadline).await;
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// `RequestBlockMain`: the indexed walk across candidate peers for the root block.
fn request_block_main(
    device: Arc<dyn PeerSource>,
    info: Arc<Mutex<CidInfo>>,
    done_tx: Arc<Mutex<Option<tokio::sync::oneshot::Sender<Result<ResultBundle, ErrorMessage>>>>>,
    status: StatusSender,
    peers: Vec<PeerId>,
    cid: Cid,
    filename: String,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let block = match fetch_from_peers(&device, &peers, 0, cid).await {
            Ok(block) => block,
            Err(_) => {
                complete(&info, &done_tx, Err(IpfsError::BitswapExhausted(cid).into())).await;
                return;
            }
        };

        let node = match FlatUnixFs::try_from(block.as_slice()) {
            Ok(node) => node,
            Err(e) => {
                complete(
                    &info,
                    &done_tx,
                    Err(IpfsError::BitswapDecodeFailed(cid, e.to_string()).into()),
                )
                .await;
                return;
            }
        };

        if node.links.is_empty() {
            let content = match validate_file_or_raw(&node) {
                Ok(content) => content.to_vec(),
                Err(e) => {
                    complete(
                        &info,
                        &done_tx,
                        Err(IpfsError::BitswapDecodeFailed(cid, e.to_string()).into()),
                    )
                    .await;
                    return;
                }
            };
            let mut guard = info.lock().await;
            guard.final_contents.push(filename, content);
            let outstanding = guard.outstanding_requests;
            drop(guard);
            if outstanding <= 0 {
                finish_if_complete(&info, &done_tx).await;
            }
            return;
        }

        for link in &node.links {
            let link_cid = match link
                .Hash
                .as_ref()
                .and_then(|hash| Cid::try_from(hash.as_ref()).ok())
            {
                Some(cid) => cid,
                None => continue,
            };
            let link_name = link
                .Name
                .as_ref()
                .map(|n| n.to_string())
                .unwrap_or_default();

            {
                let mut guard = info.lock().await;
                if !link_name.is_empty() {
                    guard.directories.push(link_name.clone());
                    guard.main_cids.push(link_cid);
                }
                guard.outstanding_requests += 1;
            }

            let path = if link_name.is_empty() {
                filename.clone()
            } else {
                link_name
            };

            tokio::spawn(request_block_sub(
                Arc::clone(&device),
                Arc::clone(&info),
                Arc::clone(&done_tx),
                status.clone(),
                peers.clone(),
                cid,
                link_cid,
                path,
                0,
            ));
        }

        let guard = info.lock().await;
        let outstanding = guard.outstanding_requests;
        drop(guard);
        if outstanding <= 0 {
            finish_if_complete(&info, &done_tx).await;
        }
    })
}

/// `RequestBlockSub`: recursive descent into a file's chunk tree or a directory's children.
#[allow(clippy::too_many_arguments)]
fn request_block_sub(
    device: Arc<dyn PeerSource>,
    info: Arc<Mutex<CidInfo>>,
    done_tx: Arc<Mutex<Option<tokio::sync::oneshot::Sender<Result<ResultBundle, ErrorMessage>>>>>,
    status: StatusSender,
    peers: Vec<PeerId>,
    parent_cid: Cid,
    current_cid: Cid,
    path_accumulator: String,
    address_offset: usize,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let block = match fetch_from_peers(&device, &peers, address_offset, current_cid).await {
            Ok(block) => block,
            Err(_) => {
                let mut guard = info.lock().await;
                guard.outstanding_requests -= 1;
                let outstanding = guard.outstanding_requests;
                drop(guard);
                if outstanding <= 0 {
                    finish_if_complete(&info, &done_tx).await;
                }
                return;
            }
        };

        {
            let mut guard = info.lock().await;
            guard.outstanding_requests -= 1;
        }

        let node = match FlatUnixFs::try_from(block.as_slice()) {
            Ok(node) => node,
            Err(e) => {
                complete(
                    &info,
                    &done_tx,
                    Err(IpfsError::BitswapDecodeFailed(current_cid, e.to_string()).into()),
                )
                .await;
                return;
            }
        };

        if node.links.is_empty() {
            let content = match validate_file_or_raw(&node) {
                Ok(content) => content.to_vec(),
                Err(e) => {
                    complete(
                        &info,
                        &done_tx,
                        Err(IpfsError::BitswapDecodeFailed(current_cid, e.to_string()).into()),
                    )
                    .await;
                    return;
                }
            };

            let mut guard = info.lock().await;
            let attached = guard
                .linked_cids
                .iter_mut()
                .find(|l| l.cid == current_cid);
            match attached {
                Some(linked) => linked.content = Some(content),
                None => guard.final_contents.push(path_accumulator.clone(), content),
            }
            let outstanding = guard.outstanding_requests;
            drop(guard);
            if outstanding <= 0 {
                let mut guard = info.lock().await;
                guard.group_linked_cids();
                drop(guard);
                finish_if_complete(&info, &done_tx).await;
            }
            return;
        }

        for link in &node.links {
            let link_cid = match link
                .Hash
                .as_ref()
                .and_then(|hash| Cid::try_from(hash.as_ref()).ok())
            {
                Some(cid) => cid,
                None => continue,
            };
            let link_name = link.Name.as_ref().map(|n| n.to_string());

            let (next_path, is_chunk) = match &link_name {
                Some(name) if !name.is_empty() => (format!("{path_accumulator}/{name}"), false),
                _ => (path_accumulator.clone(), true),
            };

            {
                let mut guard = info.lock().await;
                if !is_chunk {
                    guard.directories.push(next_path.clone());
                    guard.main_cids.push(link_cid);
                } else {
                    guard.linked_cids.push(LinkedCid {
                        cid: link_cid,
                        parent_cid: current_cid,
                        assigned_name: next_path.clone(),
                        content: None,
                    });
                }
                guard.outstanding_requests += 1;
            }

            tokio::spawn(request_block_sub(
                Arc::clone(&device),
                Arc::clone(&info),
                Arc::clone(&done_tx),
                status.clone(),
                peers.clone(),
                current_cid,
                link_cid,
                next_path,
                0,
            ));
        }

        let guard = info.lock().await;
        let outstanding = guard.outstanding_requests;
        drop(guard);
        if outstanding <= 0 {
            finish_if_complete(&info, &done_tx).await;
        }
        let _ = parent_cid; // retained on the call signature for diagnostics only
    })
}

/// Indexed walk across `peers`, starting at `offset`: ask each peer in turn until one answers or
/// every peer has been exhausted.
async fn fetch_from_peers(
    device: &Arc<dyn PeerSource>,
    peers: &[PeerId],
    offset: usize,
    cid: Cid,
) -> Result<Vec<u8>, ()> {
    for peer in peers.iter().skip(offset) {
        if let Ok(bytes) = device.request_block(*peer, cid).await {
            return Ok(bytes);
        }
    }
    Err(())
}

async fn finish_if_complete(
    info: &Arc<Mutex<CidInfo>>,
    done_tx: &Arc<Mutex<Option<tokio::sync::oneshot::Sender<Result<ResultBundle, ErrorMessage>>>>>,
) {
    let bundle = {
        let mut guard = info.lock().await;
        if guard.completed {
            return;
        }
        guard.completed = true;
        guard.final_contents.clone()
    };
    if let Some(tx) = done_tx.lock().await.take() {
        let _ = tx.send(Ok(bundle));
    }
}

async fn complete(
    info: &Arc<Mutex<CidInfo>>,
    done_tx: &Arc<Mutex<Option<tokio::sync::oneshot::Sender<Result<ResultBundle, ErrorMessage>>>>>,
    result: Result<ResultBundle, ErrorMessage>,
) {
    let mut guard = info.lock().await;
    if guard.completed {
        return;
    }
    guard.completed = true;
    drop(guard);
    if let Some(tx) = done_tx.lock().await.take() {
        let _ = tx.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::borrow::Cow;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use bitswap::BitswapError;
    use ipfs_unixfs::pb::{PBLink, UnixFs, UnixFsType};
    use libp2p::identity;

    use crate::status::status_channel;

    fn dummy_cid(byte: u8) -> Cid {
        let digest = multihash::Multihash::<64>::wrap(0x12, &[byte; 32]).unwrap();
        Cid::new_v1(0x55, digest)
    }

    /// Stands in for a live `IpfsDevice`: a single peer handing out canned dag-pb blocks by CID.
    struct MockPeerSource {
        peer: PeerId,
        blocks: HashMap<Cid, Vec<u8>>,
    }

    #[async_trait]
    impl PeerSource for MockPeerSource {
        async fn find_providers(&self, _cid: Cid) -> Vec<PeerId> {
            vec![self.peer]
        }

        async fn request_block(&self, _peer: PeerId, cid: Cid) -> Result<Vec<u8>, BitswapError> {
            self.blocks.get(&cid).cloned().ok_or(BitswapError::NotFound)
        }
    }

    fn leaf_block(kind: UnixFsType, content: &[u8]) -> Vec<u8> {
        FlatUnixFs {
            links: Vec::new(),
            data: UnixFs {
                Type: kind,
                Data: Some(Cow::Borrowed(content)),
                filesize: Some(content.len() as u64),
                ..Default::default()
            },
        }
        .encode()
    }

    #[tokio::test]
    async fn fetch_assembles_two_siblings_one_single_block_one_two_chunk() {
        let root_cid = dummy_cid(10);
        let a_cid = dummy_cid(11);
        let b_cid = dummy_cid(12);
        let chunk1_cid = dummy_cid(13);
        let chunk2_cid = dummy_cid(14);

        let a_block = leaf_block(UnixFsType::File, b"A");
        let chunk1_block = leaf_block(UnixFsType::Raw, b"X");
        let chunk2_block = leaf_block(UnixFsType::Raw, b"Y");

        let b_block = FlatUnixFs {
            links: vec![
                PBLink {
                    Hash: Some(Cow::Owned(chunk1_cid.to_bytes())),
                    Name: None,
                    Tsize: None,
                },
                PBLink {
                    Hash: Some(Cow::Owned(chunk2_cid.to_bytes())),
                    Name: None,
                    Tsize: None,
                },
            ],
            data: UnixFs {
                Type: UnixFsType::File,
                filesize: Some(2),
                blocksizes: vec![1, 1],
                ..Default::default()
            },
        }
        .encode();

        let root_block = FlatUnixFs {
            links: vec![
                PBLink {
                    Hash: Some(Cow::Owned(a_cid.to_bytes())),
                    Name: Some(Cow::Borrowed("a.txt")),
                    Tsize: None,
                },
                PBLink {
                    Hash: Some(Cow::Owned(b_cid.to_bytes())),
                    Name: Some(Cow::Borrowed("b.txt")),
                    Tsize: None,
                },
            ],
            data: UnixFs {
                Type: UnixFsType::Directory,
                ..Default::default()
            },
        }
        .encode();

        let mut blocks = HashMap::new();
        blocks.insert(root_cid, root_block);
        blocks.insert(a_cid, a_block);
        blocks.insert(b_cid, b_block);
        blocks.insert(chunk1_cid, chunk1_block);
        blocks.insert(chunk2_cid, chunk2_block);

        let peer = PeerId::from(identity::Keypair::generate_ed25519().public());
        let device: Arc<dyn PeerSource> = Arc::new(MockPeerSource { peer, blocks });

        let config = FetchCoreConfig::default();
        let (status_tx, mut status_rx) = status_channel();
        let drain = tokio::spawn(async move { while status_rx.recv().await.is_some() {} });

        let bundle = fetch(device, &config, root_cid, "root".to_owned(), status_tx)
            .await
            .unwrap();
        drain.await.unwrap();

        assert_eq!(bundle.names, vec!["a.txt", "b.txt"]);
        assert_eq!(bundle.contents[0], b"A");
        assert_eq!(bundle.contents[1], b"XY");
    }

    #[test]
    fn group_linked_cids_concatenates_in_discovery_order() {
        let mut info = CidInfo::new();
        info.linked_cids.push(LinkedCid {
            cid: dummy_cid(1),
            parent_cid: dummy_cid(0),
            assigned_name: "b.txt".to_owned(),
            content: Some(b"B".to_vec()),
        });
        info.linked_cids.push(LinkedCid {
            cid: dummy_cid(2),
            parent_cid: dummy_cid(0),
            assigned_name: "b.txt".to_owned(),
            content: Some(b"B".to_vec()),
        });
        info.linked_cids.push(LinkedCid {
            cid: dummy_cid(3),
            parent_cid: dummy_cid(0),
            assigned_name: "b.txt".to_owned(),
            content: Some(b"B".to_vec()),
        });

        info.group_linked_cids();

        assert_eq!(info.final_contents.names, vec!["b.txt"]);
        assert_eq!(info.final_contents.contents[0], b"BBB");
    }
}
