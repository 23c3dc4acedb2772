//! In-process event bus for upload lifecycle events.
//!
//! Handlers are registered on an [`EventBus`] before the run starts, then
//! [`EventBus::start`] spawns a single dispatcher task. Dispatch order:
//!
//! * events reach handlers in the order they were published;
//! * handlers for one event run in registration order;
//! * synchronous handlers finish before the next event is dispatched;
//! * asynchronous handlers are spawned and not awaited before the next event.
//!
//! [`RunningEventBus::flush`] waits for everything published so far, including
//! spawned asynchronous handlers.

use crate::core::events::{EventKind, UploadEvent};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error};

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type SyncHandler = Box<dyn Fn(&UploadEvent) + Send + Sync + 'static>;
type AsyncHandler = Box<dyn Fn(UploadEvent) -> HandlerFuture + Send + Sync + 'static>;

enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

struct Subscription {
    kinds: Vec<EventKind>,
    handler: Handler,
}

enum Message {
    Event(UploadEvent),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Subscription registry for one run.
#[derive(Default)]
pub struct EventBus {
    subscriptions: Vec<Subscription>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a synchronous handler for `kinds`.
    pub fn on<F>(&mut self, kinds: &[EventKind], handler: F) -> &mut Self
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.subscriptions.push(Subscription {
            kinds: kinds.to_vec(),
            handler: Handler::Sync(Box::new(handler)),
        });
        self
    }

    /// Registers an asynchronous handler for `kinds`. Each call is spawned as its own task.
    pub fn on_async<F, Fut>(&mut self, kinds: &[EventKind], handler: F) -> &mut Self
    where
        F: Fn(UploadEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscriptions.push(Subscription {
            kinds: kinds.to_vec(),
            handler: Handler::Async(Box::new(move |event| Box::pin(handler(event)))),
        });
        self
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn start(self) -> RunningEventBus {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch_loop(self.subscriptions, rx));
        RunningEventBus {
            publisher: EventPublisher { tx },
            dispatcher,
        }
    }
}

/// Cheap, cloneable publishing side of a running bus.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<Message>,
}

impl EventPublisher {
    pub fn publish(&self, event: UploadEvent) {
        let kind = event.kind();
        if self.tx.send(Message::Event(event)).is_err() {
            debug!("Event bus is shut down, dropping {} event", kind);
        }
    }
}

pub struct RunningEventBus {
    publisher: EventPublisher,
    dispatcher: JoinHandle<()>,
}

impl RunningEventBus {
    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    /// Waits until every event published before this call has been fully handled.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.publisher.tx.send(Message::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Dispatches everything already published, waits for async handlers and stops the dispatcher.
    pub async fn shutdown(self) {
        let _ = self.publisher.tx.send(Message::Shutdown);
        if let Err(e) = self.dispatcher.await {
            error!("Event dispatcher terminated abnormally: {}", e);
        }
    }
}

async fn dispatch_loop(subscriptions: Vec<Subscription>, mut rx: mpsc::UnboundedReceiver<Message>) {
    let mut in_flight: JoinSet<()> = JoinSet::new();

    while let Some(message) = rx.recv().await {
        match message {
            Message::Event(event) => {
                let kind = event.kind();
                for subscription in subscriptions.iter().filter(|s| s.kinds.contains(&kind)) {
                    match &subscription.handler {
                        Handler::Sync(handler) => handler(&event),
                        Handler::Async(handler) => {
                            in_flight.spawn(handler(event.clone()));
                        }
                    }
                }
                while let Some(result) = in_flight.try_join_next() {
                    log_handler_result(result);
                }
            }
            Message::Flush(done) => {
                drain(&mut in_flight).await;
                let _ = done.send(());
            }
            Message::Shutdown => break,
        }
    }

    drain(&mut in_flight).await;
    debug!("Event dispatcher stopped");
}

async fn drain(in_flight: &mut JoinSet<()>) {
    while let Some(result) = in_flight.join_next().await {
        log_handler_result(result);
    }
}

fn log_handler_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!("Async event handler failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::FileRef;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn complete(url: &str) -> UploadEvent {
        UploadEvent::DownloadComplete {
            file: FileRef::from_url(url),
            remote_id: format!("uuid-{}", url),
        }
    }

    fn failed(url: &str) -> UploadEvent {
        UploadEvent::SubmitFailed {
            file: FileRef::from_url(url),
            error: "UPLOAD_ERROR: bad".to_string(),
        }
    }

    #[tokio::test]
    async fn test_sync_handlers_see_events_in_publish_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        let sink = seen.clone();
        bus.on(&EventKind::ALL, move |e| {
            sink.lock().unwrap().push(e.file().url.clone());
        });

        let bus = bus.start();
        let publisher = bus.publisher();
        for url in ["a", "b", "c", "d"] {
            publisher.publish(complete(url));
        }
        bus.flush().await;

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c", "d"]);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_handlers_only_receive_subscribed_kinds() {
        let successes = Arc::new(Mutex::new(0));
        let failures = Arc::new(Mutex::new(0));
        let mut bus = EventBus::new();
        let s = successes.clone();
        bus.on(&[EventKind::DownloadComplete], move |_| *s.lock().unwrap() += 1);
        let f = failures.clone();
        bus.on(&EventKind::FAILURES, move |_| *f.lock().unwrap() += 1);
        assert_eq!(bus.subscriber_count(), 2);

        let bus = bus.start();
        let publisher = bus.publisher();
        publisher.publish(complete("a"));
        publisher.publish(failed("b"));
        publisher.publish(failed("c"));
        publisher.publish(UploadEvent::SubmitAccepted {
            file: FileRef::from_url("d"),
            token: "tok".to_string(),
        });
        bus.shutdown().await;

        assert_eq!(*successes.lock().unwrap(), 1);
        assert_eq!(*failures.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        let first = seen.clone();
        bus.on(&EventKind::ALL, move |_| first.lock().unwrap().push("first"));
        let second = seen.clone();
        bus.on(&EventKind::ALL, move |_| second.lock().unwrap().push("second"));

        let bus = bus.start();
        bus.publisher().publish(complete("a"));
        bus.flush().await;
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
        bus.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_waits_for_async_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        let sink = seen.clone();
        bus.on_async(&EventKind::ALL, move |e| {
            let sink = sink.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                sink.lock().unwrap().push(e.file().url.clone());
            }
        });

        let bus = bus.start();
        bus.publisher().publish(complete("slow"));
        bus.flush().await;
        assert_eq!(*seen.lock().unwrap(), vec!["slow"]);
        bus.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_handlers_do_not_block_dispatch() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        let slow = order.clone();
        bus.on_async(&[EventKind::SubmitFailed], move |_| {
            let slow = slow.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                slow.lock().unwrap().push("async");
            }
        });
        let fast = order.clone();
        bus.on(&[EventKind::DownloadComplete], move |_| {
            fast.lock().unwrap().push("sync");
        });

        let bus = bus.start();
        let publisher = bus.publisher();
        publisher.publish(failed("a"));
        publisher.publish(complete("b"));
        bus.shutdown().await;

        assert_eq!(*order.lock().unwrap(), vec!["sync", "async"]);
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_is_dropped() {
        let count = Arc::new(Mutex::new(0));
        let mut bus = EventBus::new();
        let c = count.clone();
        bus.on(&EventKind::ALL, move |_| *c.lock().unwrap() += 1);

        let bus = bus.start();
        let publisher = bus.publisher();
        publisher.publish(complete("a"));
        bus.shutdown().await;
        publisher.publish(complete("b"));

        assert_eq!(*count.lock().unwrap(), 1);
    }
}
