//! The capability trait every transport implements, plus the narrow parser/saver collaborator
//! traits the Dispatcher's intermediate callback drives. Concrete loaders live in sibling modules;
//! `file` is kept intentionally minimal, the
//! protocol state machines (`https`, `sftp`) and the IPFS handler (in `crate::ipfs`) are where the
//! real work happens.

pub mod file;
pub mod https;
pub mod sftp;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::{ErrorMessage, ResultBundle, Url};
use crate::status::StatusSender;

/// Called by the Dispatcher exactly once per `load_async`, with the assembled (possibly empty)
/// bundle, after any requested parse/save step has run.
pub type FinalCallback = Box<dyn FnOnce(ResultBundle) + Send>;

/// The boundary every transport handler implements: resolve a URL to a [`ResultBundle`], emitting
/// zero or more progress updates on `status` before returning. `cancel` is `None` unless the caller
/// supplied one to `Dispatcher::load_async`; a handler with no cancellation point of its own is free
/// to ignore it.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load_async(
        &self,
        url: &Url,
        status: StatusSender,
        cancel: Option<CancellationToken>,
    ) -> Result<ResultBundle, ErrorMessage>;
}

/// A parser plug-in, keyed by file suffix. Concrete parsers (e.g. model decoders) are external
/// collaborators; this crate only defines the seam.
pub trait Parser: Send + Sync {
    fn parse(&self, suffix: &str, bytes: &[u8]);
}

/// A saver plug-in, keyed by save scheme. Concrete savers (e.g. a local disk writer) are external
/// collaborators; this crate only defines the seam.
#[async_trait]
pub trait Saver: Send + Sync {
    async fn save(&self, url: &Url, name: &str, bytes: &[u8]) -> Result<(), ErrorMessage>;
}

/// Errors a [`Loader`] implementation may want to share scaffolding for. Handler-specific error
/// enums (`HttpsError`, `SftpError`, `IpfsError`) carry their own stage-tagged variants and flatten
/// to [`ErrorMessage`] at the callback boundary; this exists only so shared test helpers have a
/// single error type to name.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error(transparent)]
    Https(#[from] https::HttpsError),
    #[error(transparent)]
    Sftp(#[from] sftp::SftpError),
}
