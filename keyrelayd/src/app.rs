//! Runs every listener under one cancellation token and sequences shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use keyrelay_core::Notifier;
use keyrelay_transport::{ConnectionHandler, Listener, TransportKind};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct App {
    listeners: Vec<Arc<Listener>>,
    handler: Arc<dyn ConnectionHandler>,
    notifier: Arc<dyn Notifier>,
    grace: Duration,
}

/// What happened to the listeners by the time [`App::run`] returned.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Transports whose listener ended with an error.
    pub failed: Vec<TransportKind>,
    /// Some listener was still draining when the grace period ran out.
    pub grace_exceeded: bool,
}

impl ShutdownReport {
    fn record(&mut self, joined: Result<Option<TransportKind>, JoinError>) {
        match joined {
            Ok(Some(kind)) => self.failed.push(kind),
            Ok(None) => {}
            Err(e) => error!("listener task panicked: {e}"),
        }
    }
}

impl App {
    pub fn new(
        handler: Arc<dyn ConnectionHandler>,
        notifier: Arc<dyn Notifier>,
        grace: Duration,
    ) -> Self {
        Self {
            listeners: Vec::new(),
            handler,
            notifier,
            grace,
        }
    }

    pub fn add_listener(&mut self, listener: Arc<Listener>) {
        self.listeners.push(listener);
    }

    pub fn listeners(&self) -> &[Arc<Listener>] {
        &self.listeners
    }

    /// Start every listener and serve until `shutdown` resolves or no
    /// listener is left running.  Then cancel them all and wait for them at
    /// most the grace period; anything still draining after that is
    /// abandoned.
    pub async fn run<F>(self, shutdown: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        let root = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for listener in &self.listeners {
            let listener = Arc::clone(listener);
            let cancel = root.child_token();
            let handler = Arc::clone(&self.handler);
            let notifier = Arc::clone(&self.notifier);
            tasks.spawn(async move {
                let kind = listener.transport().kind();
                match listener.run(cancel, handler).await {
                    Ok(()) => {
                        debug!(transport = %kind, "listener stopped");
                        None
                    }
                    Err(e) => {
                        notifier.error(&format!("{kind} error"), &e.to_string());
                        Some(kind)
                    }
                }
            });
        }
        info!(listeners = self.listeners.len(), "keyrelayd running");

        let mut report = ShutdownReport::default();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutting down");
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(joined) => report.record(joined),
                    None => {
                        warn!("no transport is running");
                        break;
                    }
                },
            }
        }

        root.cancel();
        let drained = tokio::time::timeout(self.grace, async {
            while let Some(joined) = tasks.join_next().await {
                report.record(joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                grace_secs = self.grace.as_secs_f64(),
                remaining = tasks.len(),
                "shutdown grace period exceeded, abandoning listeners"
            );
            report.grace_exceeded = true;
            tasks.abort_all();
        }
        report
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to register SIGTERM handler: {e}, falling back to Ctrl-C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    use keyrelay_core::{BoxedStream, Severity};
    use keyrelay_transport::{
        AcceptStrategy, Accepted, Acceptor, Bound, ListenerState, Transport, TransportError,
    };
    use tokio::sync::mpsc;

    #[derive(Debug, Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<(Severity, String, String)>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, severity: Severity, title: &str, message: &str) {
            self.seen
                .lock()
                .unwrap()
                .push((severity, title.to_string(), message.to_string()));
        }
    }

    impl RecordingNotifier {
        fn errors(&self) -> Vec<String> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .filter(|(severity, _, _)| *severity == Severity::Error)
                .map(|(_, title, _)| title.clone())
                .collect()
        }
    }

    struct ChannelAcceptor(mpsc::UnboundedReceiver<BoxedStream>);

    #[async_trait::async_trait]
    impl Acceptor for ChannelAcceptor {
        fn strategy(&self) -> AcceptStrategy {
            AcceptStrategy::InterruptOnClose
        }

        async fn accept(&mut self) -> io::Result<Accepted> {
            Ok(match self.0.recv().await {
                Some(stream) => Accepted::Connection(stream),
                None => Accepted::Closed,
            })
        }
    }

    /// Hands out queued streams; binding fails once the queue was taken.
    #[derive(Debug)]
    struct QueueTransport {
        kind: TransportKind,
        queue: Mutex<Option<mpsc::UnboundedReceiver<BoxedStream>>>,
    }

    impl QueueTransport {
        fn new(kind: TransportKind) -> (Self, mpsc::UnboundedSender<BoxedStream>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = Self {
                kind,
                queue: Mutex::new(Some(rx)),
            };
            (transport, tx)
        }

        fn broken(kind: TransportKind) -> Self {
            Self {
                kind,
                queue: Mutex::new(None),
            }
        }
    }

    #[async_trait::async_trait]
    impl Transport for QueueTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn bind(&self) -> Result<Bound, TransportError> {
            let rx = self
                .queue
                .lock()
                .unwrap()
                .take()
                .ok_or(TransportError::Unsupported(self.kind))?;
            Ok(Bound {
                acceptor: Box::new(ChannelAcceptor(rx)),
                help: format!("connect to {}", self.kind),
            })
        }
    }

    /// Never finishes a connection.
    struct StuckHandler;

    #[async_trait::async_trait]
    impl ConnectionHandler for StuckHandler {
        async fn handle(&self, _stream: BoxedStream) {
            std::future::pending::<()>().await;
        }
    }

    fn listener(transport: QueueTransport, notifier: &Arc<RecordingNotifier>) -> Arc<Listener> {
        Arc::new(Listener::new(
            Arc::new(transport),
            Arc::clone(notifier) as Arc<dyn Notifier>,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_gives_up_after_grace_period() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (transport, streams) = QueueTransport::new(TransportKind::NamedPipe);
        let pipe = listener(transport, &notifier);
        let mut state = pipe.state();

        let grace = Duration::from_secs(5);
        let mut app = App::new(
            Arc::new(StuckHandler),
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            grace,
        );
        app.add_listener(Arc::clone(&pipe));

        let (client, _server_side) = tokio::io::duplex(64);
        streams.send(Box::new(client)).unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let report = app
            .run(async move {
                state
                    .wait_for(|s| *s == ListenerState::HandlingConnections)
                    .await
                    .unwrap();
                let _ = shutdown_tx.send(tokio::time::Instant::now());
            })
            .await;
        let since_shutdown = shutdown_rx.await.unwrap().elapsed();

        assert!(report.grace_exceeded);
        assert!(report.failed.is_empty());
        assert!(since_shutdown >= grace);
        assert!(since_shutdown <= grace, "gave up {since_shutdown:?} after shutdown");
        assert_eq!(pipe.in_flight(), 1);
        assert!(notifier.errors().is_empty());
    }

    #[tokio::test]
    async fn failed_transport_is_reported_once_and_others_keep_running() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (transport, _streams) = QueueTransport::new(TransportKind::Wsl);
        let wsl = listener(transport, &notifier);
        let pageant = listener(QueueTransport::broken(TransportKind::Pageant), &notifier);
        let mut wsl_state = wsl.state();

        let mut app = App::new(
            Arc::new(StuckHandler),
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            Duration::from_secs(5),
        );
        app.add_listener(Arc::clone(&wsl));
        app.add_listener(pageant);

        let report = app
            .run(async move {
                wsl_state
                    .wait_for(|s| *s == ListenerState::Accepting)
                    .await
                    .unwrap();
            })
            .await;

        assert_eq!(report.failed, vec![TransportKind::Pageant]);
        assert!(!report.grace_exceeded);
        assert_eq!(notifier.errors(), vec!["pageant error".to_string()]);
        assert_eq!(*wsl.state().borrow(), ListenerState::Closed);
    }

    #[tokio::test]
    async fn returns_when_every_transport_failed() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut app = App::new(
            Arc::new(StuckHandler),
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            Duration::from_secs(5),
        );
        app.add_listener(listener(QueueTransport::broken(TransportKind::HyperV), &notifier));

        let report = app.run(std::future::pending()).await;

        assert_eq!(report.failed, vec![TransportKind::HyperV]);
        assert_eq!(notifier.errors(), vec!["hyperv error".to_string()]);
    }
}
