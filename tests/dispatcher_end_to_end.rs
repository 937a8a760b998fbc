use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fetch_core::dispatcher::Dispatcher;
use fetch_core::loader::file::FileLoader;

#[tokio::test]
async fn file_url_round_trips_through_dispatcher() {
    fetch_core::logging::init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.bin");
    std::fs::write(&path, b"hello from disk").unwrap();

    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher
        .register_loader("file", Arc::new(FileLoader))
        .await;

    let final_calls = Arc::new(AtomicUsize::new(0));
    let final_calls_clone = Arc::clone(&final_calls);

    let (_, mut status) = dispatcher
        .load_async(
            &format!("file://{}", path.display()),
            false,
            false,
            None,
            None,
            Box::new(move |bundle| {
                final_calls_clone.fetch_add(1, Ordering::SeqCst);
                assert_eq!(bundle.names, vec!["report.bin"]);
                assert_eq!(bundle.contents[0], b"hello from disk");
            }),
        )
        .await
        .unwrap();

    let mut tags = Vec::new();
    while let Some(update) = status.recv().await {
        tags.push(update.unwrap().0);
    }
    assert_eq!(tags, vec!["reading", "completed"]);

    for _ in 0..100 {
        if dispatcher.operation_counter().is_quiescent() {
            break;
        }
        tokio::task::yield_now().await;
    }

    assert_eq!(final_calls.load(Ordering::SeqCst), 1);
    assert!(dispatcher.operation_counter().is_quiescent());
}

#[tokio::test]
async fn unregistered_scheme_never_dispatches() {
    let dispatcher = Arc::new(Dispatcher::new());
    let result = dispatcher
        .load_async(
            "gopher://example.com/x",
            false,
            false,
            None,
            None,
            Box::new(|_| {}),
        )
        .await;
    assert!(result.is_err());
    assert!(dispatcher.operation_counter().is_quiescent());
}
