//! A minimal, Bitswap-shaped block exchange protocol: "ask a peer for the bytes behind a CID,
//! get the bytes back or a not-found". It is intentionally a small subset of the real Bitswap
//! wire protocol (no WANT-lists, no session accounting, no ledger-based exchange strategy) —
//! fetch-core's retrieval engine only ever asks for one block at a time per peer, so a
//! request/response codec over libp2p's `request_response` behaviour is all it needs.

use std::io;

use async_trait::async_trait;
use cid::Cid;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::request_response;
use libp2p::StreamProtocol;
use serde::{Deserialize, Serialize};

/// The bytes behind a CID, as exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub cid: Cid,
    pub data: Vec<u8>,
}

/// Protocol name negotiated during libp2p stream multiplexing.
pub const PROTOCOL_NAME: StreamProtocol = StreamProtocol::new("/fetch-core/bitswap/1.0.0");

/// A request for the block addressed by `cid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitswapRequest {
    pub cid_bytes: Vec<u8>,
}

impl BitswapRequest {
    pub fn for_cid(cid: &Cid) -> Self {
        BitswapRequest {
            cid_bytes: cid.to_bytes(),
        }
    }

    pub fn cid(&self) -> Result<Cid, cid::Error> {
        Cid::try_from(self.cid_bytes.as_slice())
    }
}

/// A peer's answer to a [`BitswapRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BitswapResponse {
    Have { data: Vec<u8> },
    DontHave,
}

/// Errors which can occur while exchanging a block with a peer.
#[derive(Debug, thiserror::Error)]
pub enum BitswapError {
    #[error("peer does not have the requested block")]
    NotFound,
    #[error("i/o error exchanging block: {0}")]
    Io(#[from] io::Error),
    #[error("malformed message: {0}")]
    Codec(String),
}

/// Maximum message size accepted on the wire; guards against a misbehaving peer claiming an
/// unbounded length prefix.
const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

async fn read_length_prefixed<T: AsyncRead + Unpin + Send>(io: &mut T) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bitswap message exceeds maximum size",
        ));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_length_prefixed<T: AsyncWrite + Unpin + Send>(
    io: &mut T,
    payload: &[u8],
) -> io::Result<()> {
    io.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    io.write_all(payload).await?;
    io.flush().await
}

/// [`request_response::Codec`] implementation wiring [`BitswapRequest`]/[`BitswapResponse`] onto
/// length-prefixed JSON frames. JSON (rather than a bespoke binary framing) keeps this first-party
/// protocol's wire format trivial to eyeball while debugging peer exchanges.
#[derive(Debug, Clone, Default)]
pub struct BitswapCodec;

#[async_trait]
impl request_response::Codec for BitswapCodec {
    type Protocol = StreamProtocol;
    type Request = BitswapRequest;
    type Response = BitswapResponse;

    async fn read_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let bytes = read_length_prefixed(io).await?;
        serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn read_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let bytes = read_length_prefixed(io).await?;
        serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let bytes =
            serde_json::to_vec(&req).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_length_prefixed(io, &bytes).await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        res: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let bytes =
            serde_json::to_vec(&res).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_length_prefixed(io, &bytes).await
    }
}

/// `libp2p::request_response::Behaviour` specialised to the bitswap codec; this is the
/// `NetworkBehaviour` piece `fetch_core::ipfs::device` composes into its swarm.
pub type BitswapBehaviour = request_response::Behaviour<BitswapCodec>;

/// Builds a [`BitswapBehaviour`] configured to both dial out for blocks and serve them.
pub fn behaviour() -> BitswapBehaviour {
    request_response::Behaviour::new(
        [(PROTOCOL_NAME, request_response::ProtocolSupport::Full)],
        request_response::Config::default(),
    )
}
