//! Signal handling: one graceful cancellation on the first SIGINT/SIGTERM/
//! SIGQUIT, a hard exit on the second.

use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::INTERRUPT_EXIT_CODE;

/// Alerts subscribers when the wrapped signal future resolves (or `close`
/// is called) and waits for each subscriber's cleanup before finishing.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    state: Arc<Mutex<HandlerState>>,
    close: mpsc::Sender<()>,
}

#[derive(Debug, Default)]
struct HandlerState {
    subscribers: Vec<oneshot::Sender<oneshot::Sender<()>>>,
    is_closing: bool,
}

pub struct SignalSubscriber(oneshot::Receiver<oneshot::Sender<()>>);

/// Held while a subscriber winds down; dropping it reports completion.
pub struct SubscriberGuard(#[allow(dead_code)] oneshot::Sender<()>);

impl SignalHandler {
    pub fn new(signal_source: impl Future<Output = Option<()>> + Send + 'static) -> Self {
        let state = Arc::new(Mutex::new(HandlerState::default()));
        let worker_state = state.clone();
        let (close, mut close_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            tokio::select! {
                _ = signal_source => debug!("signal received, starting shutdown"),
                _ = close_rx.recv() => debug!("handler closed, starting shutdown"),
            }

            let mut callbacks = {
                let mut state = worker_state.lock().expect("signal handler lock");
                state.is_closing = true;
                state
                    .subscribers
                    .drain(..)
                    .filter_map(|subscriber| {
                        let (done_tx, done_rx) = oneshot::channel();
                        subscriber.send(done_tx).ok()?;
                        Some(done_rx)
                    })
                    .collect::<FuturesUnordered<_>>()
            };
            // wait for each subscriber to finish cleanup (or vanish)
            while callbacks.next().await.is_some() {}
        });

        Self { state, close }
    }

    /// `None` once shutdown has begun.
    pub fn subscribe(&self) -> Option<SignalSubscriber> {
        let mut state = self.state.lock().expect("signal handler lock");
        (!state.is_closing).then(|| {
            let (tx, rx) = oneshot::channel();
            state.subscribers.push(tx);
            SignalSubscriber(rx)
        })
    }

    /// Trigger the shutdown path without an OS signal.
    pub async fn close(&self) {
        if self.close.send(()).await.is_err() {
            return;
        }
        self.done().await;
    }

    /// Resolves when the worker has finished alerting subscribers.
    pub async fn done(&self) {
        self.close.closed().await;
    }
}

impl SignalSubscriber {
    pub async fn listen(self) -> SubscriberGuard {
        let callback = self
            .0
            .await
            .expect("signal handler exited without alerting subscribers");
        SubscriberGuard(callback)
    }
}

/// Future resolving on the first SIGINT/SIGTERM/SIGQUIT. A second signal
/// skips all cleanup and exits the process immediately.
#[cfg(unix)]
pub fn signal_source() -> impl Future<Output = Option<()>> + Send + 'static {
    use tokio::signal::unix::{signal, SignalKind};

    async {
        let mut interrupt = signal(SignalKind::interrupt()).ok()?;
        let mut terminate = signal(SignalKind::terminate()).ok()?;
        let mut quit = signal(SignalKind::quit()).ok()?;

        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
            _ = quit.recv() => {}
        }

        // a second signal means "stop waiting for graceful shutdown"
        tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
                _ = quit.recv() => {}
            }
            eprintln!("neex: forced exit");
            std::process::exit(INTERRUPT_EXIT_CODE);
        });

        Some(())
    }
}

#[cfg(not(unix))]
pub fn signal_source() -> impl Future<Output = Option<()>> + Send + 'static {
    async {
        tokio::signal::ctrl_c().await.ok()?;
        Some(())
    }
}
