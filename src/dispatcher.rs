//! The scheme → handler registry and the entry point every caller goes through:
//! [`Dispatcher::load_async`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::FetchCoreConfig;
use crate::loader::{FinalCallback, Loader, Parser, Saver};
use crate::model::{ErrorMessage, ResultBundle, Url, UrlParseError};
use crate::status::{status_channel, OperationCounter, StatusReceiver, StatusSender};

/// Errors the dispatcher itself can raise, before a handler ever gets a chance to run.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("could not parse url: {0}")]
    BadUrl(#[from] UrlParseError),
    #[error("no loader registered for scheme {0:?}")]
    UnknownScheme(String),
}

/// Maintains the loader/parser/saver registries and the process-wide [`OperationCounter`].
/// Registries live behind `RwLock`s so handlers can be (re-)registered from any task; there is no
/// hidden link-time registration.
pub struct Dispatcher {
    loaders: RwLock<HashMap<String, Arc<dyn Loader>>>,
    parsers: RwLock<HashMap<String, Arc<dyn Parser>>>,
    savers: RwLock<HashMap<String, Arc<dyn Saver>>>,
    counter: OperationCounter,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            loaders: RwLock::new(HashMap::new()),
            parsers: RwLock::new(HashMap::new()),
            savers: RwLock::new(HashMap::new()),
            counter: OperationCounter::new(),
        }
    }

    /// A lazily-initialised, process-wide `Dispatcher`. Offered for callers that want a shared
    /// singleton; tests should prefer [`Dispatcher::new`] so handlers can be substituted freely.
    pub async fn shared() -> &'static Dispatcher {
        static SHARED: OnceCell<Dispatcher> = OnceCell::const_new();
        SHARED.get_or_init(|| async { Dispatcher::new() }).await
    }

    pub fn operation_counter(&self) -> OperationCounter {
        self.counter.clone()
    }

    /// Registers (or idempotently replaces) the loader for `scheme`. Registration order is
    /// irrelevant; the last call for a given scheme wins.
    pub async fn register_loader(&self, scheme: impl Into<String>, handler: Arc<dyn Loader>) {
        self.loaders.write().await.insert(scheme.into(), handler);
    }

    /// Registers (or idempotently replaces) the parser for `suffix` (matched literally, without a
    /// leading `.`, against [`Url::suffix`]).
    pub async fn register_parser(&self, suffix: impl Into<String>, handler: Arc<dyn Parser>) {
        self.parsers.write().await.insert(suffix.into(), handler);
    }

    /// Registers (or idempotently replaces) the saver for `save_scheme`.
    pub async fn register_saver(&self, save_scheme: impl Into<String>, handler: Arc<dyn Saver>) {
        self.savers
            .write()
            .await
            .insert(save_scheme.into(), handler);
    }

    /// Dispatches a load by URL scheme. Increments the operation counter before invoking the
    /// handler and decrements it exactly once after `final_cb` runs — on both the success and the
    /// failure path. Returns the status stream and an opaque handle for bookkeeping; `final_cb` is
    /// invoked by the Dispatcher's own intermediate callback after any requested parse/save step.
    /// `cancel` is forwarded to the handler unchanged; `None` means "never cancel", the default a
    /// caller gets by not passing one.
    pub async fn load_async(
        self: &Arc<Self>,
        url: &str,
        parse: bool,
        save: bool,
        save_scheme: Option<String>,
        cancel: Option<CancellationToken>,
        final_cb: FinalCallback,
    ) -> Result<(OperationHandle, StatusReceiver), DispatchError> {
        let parsed = Url::parse(url)?;

        let handler = {
            let loaders = self.loaders.read().await;
            loaders
                .get(&parsed.scheme)
                .cloned()
                .ok_or_else(|| DispatchError::UnknownScheme(parsed.scheme.clone()))?
        };

        let (status_tx, status_rx) = status_channel();
        let guard = self.counter.guard();

        let dispatcher = Arc::clone(self);
        let parsed_for_task = parsed.clone();
        let status_tx_for_task = status_tx.clone();

        tokio::spawn(async move {
            let bundle = handler
                .load_async(&parsed_for_task, status_tx_for_task.clone(), cancel)
                .await;

            dispatcher
                .run_intermediate(bundle, parse, save, save_scheme, &parsed_for_task, final_cb)
                .await;

            guard.disarm();
            dispatcher.counter.decrement();
        });

        Ok((OperationHandle, status_rx))
    }

    /// The dispatcher-owned "intermediate callback": runs the requested parse/save step over each
    /// buffer in the bundle (or propagates an empty bundle untouched), then calls the caller's
    /// `final_cb` exactly once. A `None`/error `bundle` still invokes `final_cb` with an empty
    /// bundle so the caller can finalize.
    async fn run_intermediate(
        &self,
        bundle: Result<ResultBundle, ErrorMessage>,
        parse: bool,
        save: bool,
        save_scheme: Option<String>,
        url: &Url,
        final_cb: FinalCallback,
    ) {
        let bundle = match bundle {
            Ok(bundle) => bundle,
            Err(_) => ResultBundle::empty(),
        };

        if parse {
            let parsers = self.parsers.read().await;
            for (name, content) in bundle.names.iter().zip(bundle.contents.iter()) {
                let suffix = name.rsplit_once('.').map(|(_, s)| s).unwrap_or("");
                if let Some(parser) = parsers.get(suffix) {
                    parser.parse(suffix, content);
                } else {
                    tracing::warn!(suffix, "no parser registered for suffix");
                }
            }
        }

        if save {
            if let Some(scheme) = save_scheme.as_deref() {
                let savers = self.savers.read().await;
                if let Some(saver) = savers.get(scheme) {
                    for (name, content) in bundle.names.iter().zip(bundle.contents.iter()) {
                        if let Err(e) = saver.save(url, name, content).await {
                            tracing::error!(error = %e, name, "save failed");
                        }
                    }
                } else {
                    tracing::warn!(scheme, "no saver registered for save scheme");
                }
            }
        }

        final_cb(bundle);
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque handle returned by `load_async`. Carries no state; a caller that wants to cancel an
/// in-flight operation keeps its own clone of the `CancellationToken` it passed in.
#[derive(Debug, Clone, Copy)]
pub struct OperationHandle;

/// Convenience constructor bundling a [`Dispatcher`] with the handlers a binary typically wants
/// registered, reading transport knobs from `config`. Registration completes before this function
/// returns, so the dispatcher is immediately ready to accept `load_async` calls.
pub async fn with_default_handlers(config: FetchCoreConfig) -> Arc<Dispatcher> {
    let dispatcher = Arc::new(Dispatcher::new());
    let config = Arc::new(config);

    dispatcher
        .register_loader("file", Arc::new(crate::loader::file::FileLoader))
        .await;
    dispatcher
        .register_loader(
            "https",
            Arc::new(crate::loader::https::HttpsHandler::new(Arc::clone(&config))),
        )
        .await;
    dispatcher
        .register_loader(
            "sftp",
            Arc::new(crate::loader::sftp::SftpHandler::new(Arc::clone(&config))),
        )
        .await;
    dispatcher
        .register_loader(
            "ipfs",
            Arc::new(crate::ipfs::IpfsHandler::new(Arc::clone(&config)).await),
        )
        .await;

    dispatcher
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoaderError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubLoader {
        bundle: ResultBundle,
    }

    #[async_trait]
    impl Loader for StubLoader {
        async fn load_async(
            &self,
            _url: &Url,
            status: StatusSender,
            _cancel: Option<CancellationToken>,
        ) -> Result<ResultBundle, ErrorMessage> {
            let _ = status.send(Ok(crate::model::ProgressTag("completed")));
            Ok(self.bundle.clone())
        }
    }

    struct FailingLoader;

    #[async_trait]
    impl Loader for FailingLoader {
        async fn load_async(
            &self,
            _url: &Url,
            status: StatusSender,
            _cancel: Option<CancellationToken>,
        ) -> Result<ResultBundle, ErrorMessage> {
            let err = ErrorMessage::new("stub", "boom");
            let _ = status.send(Err(err.clone()));
            Err(err)
        }
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected_before_dispatch() {
        let dispatcher = Arc::new(Dispatcher::new());
        let result = dispatcher
            .load_async(
                "weird://host/path",
                false,
                false,
                None,
                None,
                Box::new(|_| {}),
            )
            .await;
        assert!(matches!(result, Err(DispatchError::UnknownScheme(s)) if s == "weird"));
    }

    #[tokio::test]
    async fn final_callback_fires_exactly_once_on_success() {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher
            .register_loader(
                "file",
                Arc::new(StubLoader {
                    bundle: ResultBundle::single("foo.bin", b"hi".to_vec()),
                }),
            )
            .await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let (_, mut status) = dispatcher
            .load_async(
                "file:///foo.bin",
                false,
                false,
                None,
                None,
                Box::new(move |bundle| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(bundle.names, vec!["foo.bin"]);
                }),
            )
            .await
            .unwrap();

        while status.recv().await.is_some() {}

        // allow the spawned task's decrement to land
        for _ in 0..50 {
            if dispatcher.operation_counter().is_quiescent() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(dispatcher.operation_counter().is_quiescent());
    }

    #[tokio::test]
    async fn final_callback_fires_with_empty_bundle_on_failure() {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher
            .register_loader("file", Arc::new(FailingLoader))
            .await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let (_, mut status) = dispatcher
            .load_async(
                "file:///foo.bin",
                false,
                false,
                None,
                None,
                Box::new(move |bundle: ResultBundle| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    assert!(bundle.is_empty());
                }),
            )
            .await
            .unwrap();

        while status.recv().await.is_some() {}
        for _ in 0..50 {
            if dispatcher.operation_counter().is_quiescent() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(dispatcher.operation_counter().is_quiescent());
    }

    #[tokio::test]
    async fn re_registering_a_scheme_replaces_the_handler() {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher
            .register_loader(
                "file",
                Arc::new(StubLoader {
                    bundle: ResultBundle::single("first", vec![1]),
                }),
            )
            .await;
        dispatcher
            .register_loader(
                "file",
                Arc::new(StubLoader {
                    bundle: ResultBundle::single("second", vec![2]),
                }),
            )
            .await;

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let (_, mut status) = dispatcher
            .load_async(
                "file:///x",
                false,
                false,
                None,
                None,
                Box::new(move |bundle: ResultBundle| {
                    seen_clone.lock().unwrap().extend(bundle.names);
                }),
            )
            .await
            .unwrap();
        while status.recv().await.is_some() {}
        for _ in 0..50 {
            if dispatcher.operation_counter().is_quiescent() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(*seen.lock().unwrap(), vec!["second".to_owned()]);
    }

    struct CancelObservingLoader {
        seen_cancelled: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl Loader for CancelObservingLoader {
        async fn load_async(
            &self,
            _url: &Url,
            status: StatusSender,
            cancel: Option<CancellationToken>,
        ) -> Result<ResultBundle, ErrorMessage> {
            let cancelled = cancel.map(|t| t.is_cancelled()).unwrap_or(false);
            self.seen_cancelled
                .store(cancelled, std::sync::atomic::Ordering::SeqCst);
            let _ = status.send(Ok(crate::model::ProgressTag("completed")));
            Ok(ResultBundle::empty())
        }
    }

    #[tokio::test]
    async fn cancellation_token_reaches_the_handler_already_cancelled() {
        let dispatcher = Arc::new(Dispatcher::new());
        let seen_cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        dispatcher
            .register_loader(
                "file",
                Arc::new(CancelObservingLoader {
                    seen_cancelled: Arc::clone(&seen_cancelled),
                }),
            )
            .await;

        let token = CancellationToken::new();
        token.cancel();

        let (_, mut status) = dispatcher
            .load_async(
                "file:///x",
                false,
                false,
                None,
                Some(token),
                Box::new(|_| {}),
            )
            .await
            .unwrap();
        while status.recv().await.is_some() {}
        for _ in 0..50 {
            if dispatcher.operation_counter().is_quiescent() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(seen_cancelled.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[allow(unused)]
    fn _avoid_unused_import(_: LoaderError) {}
}
