//! JSON over HTTP for the booking service.

pub mod error;
pub mod routes;

use core::future::Future;
use core::time::Duration;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::pin_mut;
use gym_booking_core::notify::SeatNotifier;
use gym_booking_core::store::BookingStore;
use gym_booking_core::BookingService;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument as _};

pub use crate::error::AppError;
pub use crate::routes::handle;

/// Binds the listener. The returned future serves until ctrl-c or SIGTERM.
pub async fn run_server<S: BookingStore, N: SeatNotifier>(
    service: Arc<BookingService<S, N>>,
    listen_address: SocketAddr,
    flush_every: Duration,
) -> Result<impl Future<Output = Result<(), AppError>>, AppError> {
    let listener = TcpListener::bind(listen_address).await?;
    info!(address = %listener.local_addr()?, "started up server...");
    Ok(serve(listener, service, flush_every, shutdown_signal()))
}

/// Accepts connections until `shutdown` completes, then lets the open connections and the
/// notification flusher finish.
#[allow(clippy::redundant_pub_crate)]
pub async fn serve<S: BookingStore, N: SeatNotifier>(
    listener: TcpListener,
    service: Arc<BookingService<S, N>>,
    flush_every: Duration,
    shutdown: impl Future<Output = ()> + Send,
) -> Result<(), AppError> {
    // tell the connections to shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let shutdown_tx = Arc::new(shutdown_tx);

    // wait for the connections to finish shutdown
    let (closed_tx, closed_rx) = watch::channel(());

    tokio::spawn(flush_notifications(
        Arc::clone(&service),
        flush_every,
        Arc::clone(&shutdown_tx),
        closed_rx.clone(),
    ));

    pin_mut!(shutdown);
    loop {
        select! {
            accept = listener.accept() => {
                let (socket, remote_addr) = match accept {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(%error, "failed to accept connection");
                        continue;
                    }
                };

                let service = Arc::clone(&service);
                let shutdown_tx = Arc::clone(&shutdown_tx);
                let closed_rx = closed_rx.clone();

                let fut = async move {
                    let socket = TokioIo::new(socket);
                    let hyper_service = hyper::service::service_fn(move |request: Request<Incoming>| {
                        handle(Arc::clone(&service), request)
                    });

                    let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
                    let connection = builder.serve_connection_with_upgrades(socket, hyper_service);
                    pin_mut!(connection);

                    let connection_result = select! {
                        connection_result = connection.as_mut() => connection_result,
                        () = shutdown_tx.closed() => {
                            connection.as_mut().graceful_shutdown();
                            connection.as_mut().await
                        }
                    };
                    if let Err(err) = connection_result {
                        error!("failed to serve connection: {err:#}");
                    }

                    drop(closed_rx);
                };

                tokio::spawn(fut.instrument(tracing::debug_span!("connection", %remote_addr)));
            }
            () = &mut shutdown => {
                warn!("shutting down");
                drop(shutdown_rx); // initiate shutdown
                drop(closed_rx);
                closed_tx.closed().await;
                break;
            }
        }
    }

    info!("server stopped");
    Ok(())
}

/// Drains the promotion outbox periodically, and once more on shutdown.
#[allow(clippy::redundant_pub_crate)]
async fn flush_notifications<S: BookingStore, N: SeatNotifier>(
    service: Arc<BookingService<S, N>>,
    every: Duration,
    shutdown_tx: Arc<watch::Sender<()>>,
    closed_rx: watch::Receiver<()>,
) {
    let mut interval = tokio::time::interval(every.max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let flush = || async {
        match service.flush_notifications().await {
            Ok(0) => {}
            Ok(delivered) => debug!(delivered, "notifications delivered"),
            Err(error) => error!(%error, "notification flush failed"),
        }
    };
    loop {
        select! {
            _ = interval.tick() => flush().await,
            () = shutdown_tx.closed() => break,
        }
    }
    flush().await;
    drop(closed_rx);
}

#[allow(clippy::redundant_pub_crate)]
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(%error, "failed to install Ctrl+C handler");
            core::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(error) => {
                error!(%error, "failed to install signal handler");
                core::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = core::future::pending::<()>();

    select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
