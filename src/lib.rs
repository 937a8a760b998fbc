//! A pluggable asynchronous file-fetching core: a [`Dispatcher`] routes `<scheme>://` URLs to a
//! transport-specific [`loader::Loader`] (local file, HTTPS, SFTP, or content-addressed IPFS
//! retrieval) and reports progress over a per-request status channel.

pub mod config;
pub mod dispatcher;
pub mod ipfs;
pub mod loader;
pub mod logging;
pub mod model;
pub mod status;

pub use config::FetchCoreConfig;
pub use dispatcher::{DispatchError, Dispatcher};
pub use model::{ErrorMessage, ProgressTag, ResultBundle, Url};
pub use status::{OperationCounter, StatusReceiver, StatusSender, StatusUpdate};
