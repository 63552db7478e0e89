//! The generic accept loop shared by every transport.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use keyrelay_core::Notifier;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::{AcceptStrategy, Accepted, Bound, ConnectionHandler, Transport, TransportError};

/// Consecutive accept failures tolerated before the listener gives up.
const MAX_ACCEPT_FAILURES: u32 = 5;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Accept errors that concern only the client being accepted.
fn client_went_away(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF
        .saturating_mul(1u32 << failures.saturating_sub(1).min(16))
        .min(MAX_ACCEPT_BACKOFF)
}

/// Lifecycle of a listener.  Moves forward only, except that `Accepting` and
/// `HandlingConnections` alternate as connections come and go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Listening,
    /// Waiting for a client with no connection in flight.
    Accepting,
    /// At least one connection task is running.
    HandlingConnections,
    Draining,
    Closed,
}

#[derive(Debug)]
struct Shared {
    state: watch::Sender<ListenerState>,
    in_flight: AtomicUsize,
}

impl Shared {
    fn set(&self, state: ListenerState) {
        self.state.send_replace(state);
    }

    fn connection_started(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.state.send_if_modified(|state| {
            if *state == ListenerState::Accepting {
                *state = ListenerState::HandlingConnections;
                true
            } else {
                false
            }
        });
    }

    fn connection_finished(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.send_if_modified(|state| {
                if *state == ListenerState::HandlingConnections {
                    *state = ListenerState::Accepting;
                    true
                } else {
                    false
                }
            });
        }
    }
}

/// Keeps the in-flight count honest however the connection task ends.
struct ConnectionGuard(Arc<Shared>);

impl ConnectionGuard {
    fn new(shared: Arc<Shared>) -> Self {
        shared.connection_started();
        Self(shared)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.connection_finished();
    }
}

/// Runs one transport: bind, announce, accept, hand off, drain.
pub struct Listener {
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    shared: Arc<Shared>,
    next_connection_id: AtomicU64,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("transport", &self.transport)
            .field("state", &*self.shared.state.borrow())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Listener {
    pub fn new(transport: Arc<dyn Transport>, notifier: Arc<dyn Notifier>) -> Self {
        let (state, _) = watch::channel(ListenerState::Created);
        Self {
            transport,
            notifier,
            shared: Arc::new(Shared {
                state,
                in_flight: AtomicUsize::new(0),
            }),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.shared.state.subscribe()
    }

    /// Connections accepted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Serve until `cancel` fires, the acceptor reports `Closed`, or accept
    /// keeps failing.  A client that disconnects mid-accept is skipped; any
    /// other accept error is retried with backoff, and only
    /// [`MAX_ACCEPT_FAILURES`] in a row end the listener.  The OS resource is
    /// released before in-flight connections are awaited; the wait itself is
    /// unbounded.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<(), TransportError> {
        let kind = self.transport.kind();

        let Bound { mut acceptor, help } = match self.transport.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                self.shared.set(ListenerState::Closed);
                return Err(e);
            }
        };
        self.shared.set(ListenerState::Listening);
        info!(transport = %kind, "listening");
        self.notifier.info(&kind.to_string(), &help);

        let strategy = acceptor.strategy();
        let tracker = TaskTracker::new();
        self.shared.set(ListenerState::Accepting);

        let mut failures = 0u32;
        let result = loop {
            let accepted = match strategy {
                AcceptStrategy::InterruptOnClose => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Ok(()),
                        accepted = acceptor.accept() => accepted,
                    }
                }
                AcceptStrategy::Poll(deadline) => {
                    if cancel.is_cancelled() {
                        break Ok(());
                    }
                    match tokio::time::timeout(deadline, acceptor.accept()).await {
                        Ok(accepted) => accepted,
                        Err(_) => Ok(Accepted::TimedOut),
                    }
                }
            };

            match accepted {
                Ok(Accepted::Connection(stream)) => {
                    failures = 0;
                    let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    debug!(transport = %kind, connection = id, "accepted connection");
                    let guard = ConnectionGuard::new(Arc::clone(&self.shared));
                    let handler = Arc::clone(&handler);
                    tracker.spawn(async move {
                        let _guard = guard;
                        handler.handle(stream).await;
                        debug!(transport = %kind, connection = id, "connection closed");
                    });
                }
                Ok(Accepted::TimedOut) => failures = 0,
                Ok(Accepted::Closed) => {
                    debug!(transport = %kind, "acceptor closed");
                    break Ok(());
                }
                Err(source) if client_went_away(&source) => {
                    debug!(transport = %kind, error = %source, "client left during accept");
                }
                Err(source) => {
                    failures += 1;
                    if failures >= MAX_ACCEPT_FAILURES {
                        warn!(
                            transport = %kind,
                            error = %source,
                            failures,
                            "accept failed, giving up"
                        );
                        break Err(TransportError::Accept {
                            transport: kind,
                            source,
                        });
                    }
                    let backoff = accept_backoff(failures);
                    warn!(
                        transport = %kind,
                        error = %source,
                        failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "accept failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        };

        drop(acceptor);
        self.shared.set(ListenerState::Draining);
        tracker.close();
        debug!(transport = %kind, in_flight = self.in_flight(), "draining connections");
        tracker.wait().await;
        self.shared.set(ListenerState::Closed);
        info!(transport = %kind, "stopped");

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use keyrelay_core::notify::Severity;
    use keyrelay_core::BoxedStream;
    use tokio::sync::{Notify, mpsc};

    use crate::{Acceptor, TransportKind};

    #[derive(Debug, Default)]
    struct RecordingNotifier(Mutex<Vec<(Severity, String, String)>>);

    impl Notifier for RecordingNotifier {
        fn notify(&self, severity: Severity, title: &str, message: &str) {
            self.0
                .lock()
                .unwrap()
                .push((severity, title.to_string(), message.to_string()));
        }
    }

    /// Acceptor fed from a channel; a closed channel reports `Closed`.
    struct ChannelAcceptor {
        strategy: AcceptStrategy,
        rx: mpsc::UnboundedReceiver<io::Result<Accepted>>,
        accepts: Arc<AtomicUsize>,
        dropped: Arc<Notify>,
    }

    impl Drop for ChannelAcceptor {
        fn drop(&mut self) {
            self.dropped.notify_one();
        }
    }

    #[async_trait::async_trait]
    impl Acceptor for ChannelAcceptor {
        fn strategy(&self) -> AcceptStrategy {
            self.strategy
        }

        async fn accept(&mut self) -> io::Result<Accepted> {
            self.accepts.fetch_add(1, Ordering::SeqCst);
            match self.rx.recv().await {
                Some(item) => item,
                None => Ok(Accepted::Closed),
            }
        }
    }

    #[derive(Debug)]
    struct FakeTransport {
        strategy: AcceptStrategy,
        fail_bind: bool,
        rx: Mutex<Option<mpsc::UnboundedReceiver<io::Result<Accepted>>>>,
        accepts: Arc<AtomicUsize>,
        dropped: Arc<Notify>,
    }

    impl FakeTransport {
        fn new(strategy: AcceptStrategy) -> (Arc<Self>, mpsc::UnboundedSender<io::Result<Accepted>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = Arc::new(Self {
                strategy,
                fail_bind: false,
                rx: Mutex::new(Some(rx)),
                accepts: Arc::new(AtomicUsize::new(0)),
                dropped: Arc::new(Notify::new()),
            });
            (transport, tx)
        }
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Wsl
        }

        async fn bind(&self) -> Result<Bound, TransportError> {
            if self.fail_bind {
                return Err(TransportError::Bind {
                    transport: TransportKind::Wsl,
                    source: io::Error::from(io::ErrorKind::AddrInUse),
                });
            }
            let rx = self.rx.lock().unwrap().take().expect("bound twice");
            Ok(Bound {
                acceptor: Box::new(ChannelAcceptor {
                    strategy: self.strategy,
                    rx,
                    accepts: Arc::clone(&self.accepts),
                    dropped: Arc::clone(&self.dropped),
                }),
                help: "export SSH_AUTH_SOCK=/tmp/test.sock".to_string(),
            })
        }
    }

    /// Holds every connection open until released.
    #[derive(Default)]
    struct GatedHandler {
        release: Notify,
        handled: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ConnectionHandler for GatedHandler {
        async fn handle(&self, _stream: BoxedStream) {
            self.handled.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
        }
    }

    fn connection() -> io::Result<Accepted> {
        let (a, _b) = tokio::io::duplex(64);
        Ok(Accepted::Connection(Box::new(a)))
    }

    async fn wait_for_state(rx: &mut watch::Receiver<ListenerState>, want: ListenerState) {
        rx.wait_for(|s| *s == want).await.unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_reported_without_notification() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(tx);
        let transport = Arc::new(FakeTransport {
            strategy: AcceptStrategy::InterruptOnClose,
            fail_bind: true,
            rx: Mutex::new(Some(rx)),
            accepts: Arc::new(AtomicUsize::new(0)),
            dropped: Arc::new(Notify::new()),
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let listener = Listener::new(transport, notifier.clone());

        let err = listener
            .run(CancellationToken::new(), Arc::new(GatedHandler::default()))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Bind { .. }));
        assert_eq!(*listener.state().borrow(), ListenerState::Closed);
        assert!(notifier.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_acceptor_ends_gracefully_and_announces_help_once() {
        let (transport, tx) = FakeTransport::new(AcceptStrategy::InterruptOnClose);
        drop(tx);
        let notifier = Arc::new(RecordingNotifier::default());
        let listener = Listener::new(transport, notifier.clone());

        listener
            .run(CancellationToken::new(), Arc::new(GatedHandler::default()))
            .await
            .unwrap();

        let notes = notifier.0.lock().unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, Severity::Info);
        assert_eq!(notes[0].1, "wsl");
        assert!(notes[0].2.contains("SSH_AUTH_SOCK"));
        assert_eq!(*listener.state().borrow(), ListenerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_accept_errors_are_fatal() {
        let (transport, tx) = FakeTransport::new(AcceptStrategy::InterruptOnClose);
        let accepts = Arc::clone(&transport.accepts);
        for _ in 0..MAX_ACCEPT_FAILURES {
            tx.send(Err(io::Error::from(io::ErrorKind::PermissionDenied)))
                .unwrap();
        }
        let listener = Listener::new(transport, Arc::new(RecordingNotifier::default()));

        let err = listener
            .run(CancellationToken::new(), Arc::new(GatedHandler::default()))
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Accept { .. }));
        assert_eq!(accepts.load(Ordering::SeqCst), MAX_ACCEPT_FAILURES as usize);
    }

    #[tokio::test]
    async fn aborted_client_does_not_stop_the_listener() {
        let (transport, tx) = FakeTransport::new(AcceptStrategy::InterruptOnClose);
        let listener = Arc::new(Listener::new(
            transport,
            Arc::new(RecordingNotifier::default()),
        ));
        let handler = Arc::new(GatedHandler::default());
        let cancel = CancellationToken::new();

        let run = tokio::spawn({
            let listener = Arc::clone(&listener);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            async move { listener.run(cancel, handler).await }
        });

        tx.send(Err(io::Error::from(io::ErrorKind::ConnectionAborted)))
            .unwrap();
        tx.send(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
            .unwrap();
        tx.send(connection()).unwrap();
        while handler.handled.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }

        cancel.cancel();
        handler.release.notify_waiters();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn accept_error_backs_off_then_recovers() {
        let (transport, tx) = FakeTransport::new(AcceptStrategy::InterruptOnClose);
        let listener = Arc::new(Listener::new(
            transport,
            Arc::new(RecordingNotifier::default()),
        ));
        let handler = Arc::new(GatedHandler::default());
        let cancel = CancellationToken::new();

        let run = tokio::spawn({
            let listener = Arc::clone(&listener);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            async move { listener.run(cancel, handler).await }
        });

        // What EMFILE looks like once it reaches std.
        tx.send(Err(io::Error::other("too many open files"))).unwrap();
        tx.send(connection()).unwrap();
        while handler.handled.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }
        assert!(!run.is_finished());

        cancel.cancel();
        handler.release.notify_waiters();
        run.await.unwrap().unwrap();
    }

    #[test]
    fn backoff_doubles_up_to_a_ceiling() {
        assert_eq!(accept_backoff(1), Duration::from_millis(50));
        assert_eq!(accept_backoff(2), Duration::from_millis(100));
        assert_eq!(accept_backoff(4), Duration::from_millis(400));
        assert_eq!(accept_backoff(10), MAX_ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn cancellation_releases_resource_then_drains_connections() {
        let (transport, tx) = FakeTransport::new(AcceptStrategy::InterruptOnClose);
        let dropped = Arc::clone(&transport.dropped);
        let listener = Arc::new(Listener::new(
            transport,
            Arc::new(RecordingNotifier::default()),
        ));
        let handler = Arc::new(GatedHandler::default());
        let cancel = CancellationToken::new();
        let mut state = listener.state();

        let run = tokio::spawn({
            let listener = Arc::clone(&listener);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            async move { listener.run(cancel, handler).await }
        });

        tx.send(connection()).unwrap();
        tx.send(connection()).unwrap();
        wait_for_state(&mut state, ListenerState::HandlingConnections).await;
        while handler.handled.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(listener.in_flight(), 2);

        cancel.cancel();
        dropped.notified().await;
        wait_for_state(&mut state, ListenerState::Draining).await;
        assert!(!run.is_finished());

        handler.release.notify_waiters();
        run.await.unwrap().unwrap();
        assert_eq!(listener.in_flight(), 0);
        assert_eq!(*state.borrow(), ListenerState::Closed);
    }

    #[tokio::test]
    async fn state_returns_to_accepting_when_connections_finish() {
        let (transport, tx) = FakeTransport::new(AcceptStrategy::InterruptOnClose);
        let listener = Arc::new(Listener::new(
            transport,
            Arc::new(RecordingNotifier::default()),
        ));
        let handler = Arc::new(GatedHandler::default());
        let cancel = CancellationToken::new();
        let mut state = listener.state();

        let run = tokio::spawn({
            let listener = Arc::clone(&listener);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            async move { listener.run(cancel, handler).await }
        });

        tx.send(connection()).unwrap();
        wait_for_state(&mut state, ListenerState::HandlingConnections).await;
        while handler.handled.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }
        handler.release.notify_waiters();
        wait_for_state(&mut state, ListenerState::Accepting).await;

        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn poll_strategy_times_out_and_observes_cancellation() {
        let (transport, _tx) = FakeTransport::new(AcceptStrategy::Poll(Duration::from_secs(1)));
        let accepts = Arc::clone(&transport.accepts);
        let listener = Arc::new(Listener::new(
            transport,
            Arc::new(RecordingNotifier::default()),
        ));
        let cancel = CancellationToken::new();

        let run = tokio::spawn({
            let listener = Arc::clone(&listener);
            let cancel = cancel.clone();
            async move {
                listener
                    .run(cancel, Arc::new(GatedHandler::default()))
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        // Three full deadlines plus the attempt that was in progress.
        assert_eq!(accepts.load(Ordering::SeqCst), 4);
    }
}
