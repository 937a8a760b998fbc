use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use fetch_core::dispatcher::Dispatcher;
use fetch_core::loader::file::FileLoader;
use fetch_core::model::ResultBundle;

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

#[derive(Clone, Default)]
struct CaptureLayer {
    events: Arc<Mutex<Vec<(Level, String)>>>,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.events
            .lock()
            .unwrap()
            .push((*event.metadata().level(), visitor.0));
    }
}

#[tokio::test]
async fn dispatch_with_no_matching_parser_logs_a_warning() {
    let capture = CaptureLayer::default();
    let events = Arc::clone(&capture.events);
    let subscriber = tracing_subscriber::registry().with(capture);
    // the warning fires inside a task spawned by `load_async`, on its own call stack, so a
    // scoped `with_default` guard around just that call would already have been dropped by the
    // time the task runs; this test needs the process-wide default instead.
    tracing::subscriber::set_global_default(subscriber)
        .expect("no other global subscriber set in this test binary");

    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher
        .register_loader("file", Arc::new(FileLoader))
        .await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.unknownsuffix");
    std::fs::write(&path, b"payload").unwrap();

    let (_, mut status) = dispatcher
        .load_async(
            &format!("file://{}", path.display()),
            true,
            false,
            None,
            None,
            Box::new(|_: ResultBundle| {}),
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

    let seen = events.lock().unwrap();
    assert!(
        seen.iter().any(|(level, msg)| *level >= Level::WARN
            && msg.contains("no parser registered")),
        "expected a WARN-or-above event about the missing parser, got {seen:?}"
    );
}
