use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use axum::Router;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use tokio::{
    net::{TcpListener, TcpStream},
    signal,
    sync::watch,
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every in-flight request finished inside the grace period.
    Graceful,
    /// The grace period elapsed and the remaining connections were aborted.
    Forced,
}

/// Drives `Running -> Draining -> Stopped`. `Stopped` is terminal.
#[derive(Clone, Debug)]
pub struct ShutdownCoordinator {
    state: Arc<watch::Sender<ShutdownState>>,
    grace_period: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace_period: Duration) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            state: Arc::new(state),
            grace_period,
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Starts draining. Only the first call has an effect.
    pub fn trigger(&self) {
        let started = self.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Draining;
                true
            } else {
                false
            }
        });
        if started {
            info!(
                target = "supertonic::shutdown",
                grace_secs = self.grace_period.as_secs_f32(),
                "draining in-flight requests"
            );
        }
    }

    /// Resolves once draining has begun.
    pub fn draining(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.state.subscribe();
        async move {
            let _ = rx.wait_for(|state| *state != ShutdownState::Running).await;
        }
    }

    /// Calls [`trigger`](Self::trigger) on Ctrl-C or SIGTERM.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            coordinator.trigger();
        })
    }

    /// Serves `router` until draining begins, then waits at most the grace
    /// period for in-flight requests. Connections still open after that are
    /// aborted.
    pub async fn serve(&self, listener: TcpListener, router: Router) -> io::Result<DrainOutcome> {
        let mut connections = JoinSet::new();
        let draining = self.draining();
        tokio::pin!(draining);

        loop {
            tokio::select! {
                _ = &mut draining => break,
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(target = "supertonic::shutdown", %err, "failed to accept connection");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    connections.spawn(serve_connection(
                        stream,
                        remote_addr,
                        router.clone(),
                        self.draining(),
                    ));
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        drop(listener);

        let drained = tokio::time::timeout(self.grace_period, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        let outcome = match drained {
            Ok(()) => DrainOutcome::Graceful,
            Err(_) => {
                let remaining = connections.len();
                connections.shutdown().await;
                warn!(
                    target = "supertonic::shutdown",
                    grace_secs = self.grace_period.as_secs_f32(),
                    remaining,
                    "grace period elapsed; closed remaining connections"
                );
                DrainOutcome::Forced
            }
        };

        self.state.send_replace(ShutdownState::Stopped);
        if outcome == DrainOutcome::Graceful {
            info!(target = "supertonic::shutdown", "all requests drained");
        }
        Ok(outcome)
    }
}

async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    router: Router,
    draining: impl Future<Output = ()>,
) {
    let builder = auto::Builder::new(TokioExecutor::new());
    let connection =
        builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(router));
    tokio::pin!(connection);
    tokio::pin!(draining);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = &mut draining => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(err) = result {
        debug!(target = "supertonic::shutdown", %remote_addr, %err, "connection closed with error");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(target = "supertonic::shutdown", %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                error!(target = "supertonic::shutdown", %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(target = "supertonic::shutdown", "shutdown signal received");
}

#[cfg(test)]
mod tests {
    use axum::routing::get;

    use super::*;

    async fn spawn_slow_server(
        coordinator: &ShutdownCoordinator,
        delay: Duration,
    ) -> (SocketAddr, JoinHandle<io::Result<DrainOutcome>>) {
        let router = Router::new().route(
            "/slow",
            get(move || async move {
                tokio::time::sleep(delay).await;
                "done"
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let coordinator = coordinator.clone();
        let handle = tokio::spawn(async move { coordinator.serve(listener, router).await });
        (addr, handle)
    }

    #[test]
    fn trigger_is_idempotent() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        assert_eq!(coordinator.state(), ShutdownState::Running);
        coordinator.trigger();
        assert_eq!(coordinator.state(), ShutdownState::Draining);
        coordinator.trigger();
        assert_eq!(coordinator.state(), ShutdownState::Draining);
    }

    #[tokio::test]
    async fn draining_resolves_after_trigger() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let waiter = tokio::spawn(coordinator.draining());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        coordinator.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn in_flight_request_finishes_during_drain() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let (addr, server) = spawn_slow_server(&coordinator, Duration::from_millis(300)).await;

        let request = tokio::spawn(async move {
            reqwest::get(format!("http://{addr}/slow"))
                .await?
                .text()
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        coordinator.trigger();

        assert_eq!(request.await.unwrap().unwrap(), "done");
        assert_eq!(server.await.unwrap().unwrap(), DrainOutcome::Graceful);
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
    }

    #[tokio::test]
    async fn slow_request_is_cut_off_after_grace_period() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(100));
        let (addr, server) = spawn_slow_server(&coordinator, Duration::from_millis(1500)).await;

        let request = tokio::spawn(async move {
            reqwest::get(format!("http://{addr}/slow"))
                .await?
                .text()
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        coordinator.trigger();

        let outcome = tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, DrainOutcome::Forced);
        assert_eq!(coordinator.state(), ShutdownState::Stopped);

        let response = tokio::time::timeout(Duration::from_secs(1), request)
            .await
            .expect("client should observe the closed connection before the handler finishes")
            .unwrap();
        assert!(response.is_err(), "request completed after a forced drain");
    }

    #[tokio::test]
    async fn listener_is_closed_once_draining() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let (addr, server) = spawn_slow_server(&coordinator, Duration::from_millis(10)).await;

        coordinator.trigger();
        assert_eq!(server.await.unwrap().unwrap(), DrainOutcome::Graceful);
        assert!(reqwest::get(format!("http://{addr}/slow")).await.is_err());
    }
}
