//! Content-addressed retrieval over IPFS/Bitswap: [`IpfsHandler`] implements the [`Loader`]
//! contract on top of a lazily-constructed [`IpfsDevice`] and the recursive DAG-walking `engine`.

pub mod device;
pub mod engine;

use std::convert::TryFrom;
use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::FetchCoreConfig;
use crate::model::{ErrorMessage, ResultBundle, Url};
use crate::status::StatusSender;

use self::device::IpfsDevice;
pub use self::device::PeerSource;
pub use self::engine::IpfsError;

use super::loader::Loader;

pub struct IpfsHandler {
    config: Arc<FetchCoreConfig>,
    device: OnceCell<IpfsDevice>,
}

impl IpfsHandler {
    pub async fn new(config: Arc<FetchCoreConfig>) -> Self {
        IpfsHandler {
            config,
            device: OnceCell::new(),
        }
    }

    async fn device(&self) -> &IpfsDevice {
        self.device
            .get_or_init(|| IpfsDevice::new(&self.config))
            .await
    }
}

#[async_trait]
impl Loader for IpfsHandler {
    async fn load_async(
        &self,
        url: &Url,
        status: StatusSender,
        _cancel: Option<CancellationToken>,
    ) -> Result<ResultBundle, ErrorMessage> {
        let root_cid = Cid::try_from(url.authority.as_str())
            .map_err(|e| ErrorMessage::new("ipfs", format!("invalid root cid: {e}")))?;

        let filename = url.basename();
        let filename = if filename.is_empty() {
            root_cid.to_string()
        } else {
            filename.to_owned()
        };

        let device: Arc<dyn PeerSource> = Arc::new(self.device().await.clone());
        engine::fetch(device, &self.config, root_cid, filename, status).await
    }
}
