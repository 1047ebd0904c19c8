// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tokio::signal;
use tracing::{debug, error, info, warn};

use crate::dispatch::{ConnectionLane, DispatchUnit, Dispatcher, MessageHandler, SessionListener};
use crate::network::{ClientHandle, ClientRegistry, Connection};
use crate::{AppError, AppResult};

use super::{NetworkConfig, ServerConfig, Shutdown};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// TCP server for terminal frames.
///
/// `start` binds and spawns the accept loop; every accepted connection gets its own
/// read loop that cuts frames and hands them to the dispatcher. `stop` tears all of
/// it down. Both are idempotent.
pub struct SpaServer<H: MessageHandler> {
    config: Arc<ServerConfig>,
    handler: Arc<H>,
    registry: Arc<ClientRegistry>,
    listening: Arc<AtomicBool>,
    state: Mutex<Option<Running<H>>>,
}

struct Running<H: MessageHandler> {
    local_addr: SocketAddr,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
    acceptor: JoinHandle<()>,
    dispatcher: Arc<Dispatcher<H>>,
}

impl<H: MessageHandler> SpaServer<H> {
    pub fn new(config: ServerConfig, handler: H) -> Self {
        let handler = Arc::new(handler);
        let listener: Arc<dyn SessionListener> = handler.clone();
        SpaServer {
            config: Arc::new(config),
            handler,
            registry: Arc::new(ClientRegistry::new(listener)),
            listening: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.as_ref().map(|running| running.local_addr)
    }

    /// Binds the configured address and starts accepting connections.
    ///
    /// Calling it while already listening returns the bound address and does
    /// nothing else. A bind failure leaves the server stopped and safe to retry.
    pub async fn start(&self) -> AppResult<SocketAddr> {
        let mut state = self.state.lock().await;
        if let Some(running) = state.as_ref() {
            if self.is_listening() {
                debug!(addr = %running.local_addr, "server already listening");
                return Ok(running.local_addr);
            }
            // the accept loop died on its own, clean up before rebinding
            if let Some(stale) = state.take() {
                self.shutdown_running(stale).await;
            }
        }

        self.config.validate()?;
        let network = &self.config.network;
        let listener = bind(network).await?;
        let local_addr = listener.local_addr()?;
        info!("tcp server binding to {} for listening", local_addr);

        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let dispatcher = Arc::new(Dispatcher::new(self.handler.clone(), &self.config.dispatch));
        info!(
            strategy = ?dispatcher.strategy(),
            pool_size = self.config.dispatch.pool_size,
            "dispatcher started"
        );

        let acceptor = Acceptor {
            listener,
            config: self.config.clone(),
            limit_connections: Arc::new(Semaphore::new(network.max_connection)),
            notify_shutdown: notify_shutdown.clone(),
            shutdown_complete_tx,
            registry: self.registry.clone(),
            dispatcher: dispatcher.clone(),
        };
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        let listening = self.listening.clone();
        listening.store(true, Ordering::Release);
        let acceptor = tokio::spawn(async move {
            tokio::select! {
                res = acceptor.run() => {
                    if let Err(err) = res {
                        error!(cause = %err, "failed to accept");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("accept loop received shutdown signal");
                }
            }
            listening.store(false, Ordering::Release);
        });

        *state = Some(Running {
            local_addr,
            notify_shutdown,
            shutdown_complete_rx,
            acceptor,
            dispatcher,
        });
        Ok(local_addr)
    }

    /// Stops accepting, closes every connection and drains the dispatcher.
    /// Calling it on a stopped server does nothing.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        match state.take() {
            Some(running) => self.shutdown_running(running).await,
            None => debug!("server is not running"),
        }
    }

    /// Starts the server and runs until Ctrl-C.
    pub async fn run_until_ctrl_c(&self) -> AppResult<()> {
        self.start().await?;
        signal::ctrl_c().await?;
        info!("get shutdown signal");
        self.stop().await;
        Ok(())
    }

    // Shutdown sequence:
    // 1. The accept loop is cancelled and its listener dropped.
    // 2. The notify sender is dropped. Connection handlers subscribed before the accept
    //    loop exited, so all of them observe either the signal or the closed channel,
    //    stop reading, unregister and drop their `shutdown_complete_tx`.
    // 3. Once every sender is gone `shutdown_complete_rx` yields `None`.
    // 4. The dispatcher stops taking frames and drains.
    // Steps 3 and 4 share one deadline, `drain_timeout` after the accept loop exited.
    async fn shutdown_running(&self, running: Running<H>) {
        let Running {
            local_addr,
            notify_shutdown,
            mut shutdown_complete_rx,
            acceptor,
            dispatcher,
        } = running;
        self.listening.store(false, Ordering::Release);

        let _ = notify_shutdown.send(());
        if let Err(e) = acceptor.await {
            error!("accept loop task failed: {}", e);
        }
        drop(notify_shutdown);

        let grace = self.config.dispatch.drain_timeout();
        let deadline = Instant::now() + grace;
        if time::timeout_at(deadline, shutdown_complete_rx.recv())
            .await
            .is_err()
        {
            warn!(
                remaining = self.registry.len(),
                "connection handlers still running after {:?}", grace
            );
        }

        dispatcher
            .shutdown(deadline.saturating_duration_since(Instant::now()))
            .await;
        info!(addr = %local_addr, "tcp server stopped");
    }
}

async fn bind(network: &NetworkConfig) -> AppResult<TcpListener> {
    let listen_address = network.listen_address();
    let addr = lookup_host(listen_address.as_str())
        .await
        .map_err(|e| AppError::Bind(listen_address.clone(), e))?
        .next()
        .ok_or_else(|| AppError::InvalidValue(format!("no address for {}", listen_address)))?;

    let bind_socket = || -> std::io::Result<TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        // accepted sockets inherit SO_KEEPALIVE from the listener
        socket.set_keepalive(network.keep_alive)?;
        socket.bind(addr)?;
        socket.listen(network.backlog)
    };
    bind_socket().map_err(|e| {
        error!(
            "Failed to bind server to address: {} - Error: {}",
            listen_address, e
        );
        AppError::Bind(listen_address, e)
    })
}

struct Acceptor<H: MessageHandler> {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    registry: Arc<ClientRegistry>,
    dispatcher: Arc<Dispatcher<H>>,
}

impl<H: MessageHandler> Acceptor<H> {
    /// Accepts connections until accepting fails past the backoff budget.
    async fn run(&self) -> AppResult<()> {
        let network = &self.config.network;
        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| AppError::IllegalState("connection limiter closed".into()))?;

            let (socket, peer) = self.accept().await?;
            if let Err(e) = socket.set_nodelay(network.nodelay) {
                warn!(%peer, "set_nodelay failed: {}", e);
            }

            let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
            debug!(%peer, connection_id, "accept new connection");
            let (reader, writer) = socket.into_split();

            let handler = ConnectionHandler {
                connection: Connection::new(reader, network),
                client: Arc::new(ClientHandle::new(
                    connection_id,
                    peer,
                    writer,
                    network.write_timeout(),
                )),
                registry: self.registry.clone(),
                dispatcher: self.dispatcher.clone(),
                lane: Arc::new(ConnectionLane::new()),
                // subscribe here, before the accept loop can observe shutdown
                shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
                _shutdown_complete_tx: self.shutdown_complete_tx.clone(),
            };

            tokio::spawn(async move {
                handler.run().await;
                // whether gracefully or unexpectedly closed, release connection
                drop(permit);
            });
        }
    }

    async fn accept(&self) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::Accept(err.to_string()));
                    }
                    warn!("accept failed, retrying in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

// one per accepted connection
struct ConnectionHandler<H: MessageHandler> {
    connection: Connection,
    client: Arc<ClientHandle>,
    registry: Arc<ClientRegistry>,
    dispatcher: Arc<Dispatcher<H>>,
    lane: Arc<ConnectionLane>,
    shutdown: Shutdown,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl<H: MessageHandler> ConnectionHandler<H> {
    async fn run(mut self) {
        let peer = self.client.peer();
        let connection_id = self.client.connection_id();
        if !self.registry.add(self.client.clone()) {
            self.client.close().await;
            return;
        }

        match self.receive_loop().await {
            Ok(()) => debug!(%peer, connection_id, "connection closed"),
            Err(e) if e.is_framing_error() => {
                warn!(%peer, connection_id, "protocol violation, disconnecting: {}", e);
            }
            Err(AppError::IoError(e))
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
                ) =>
            {
                debug!(%peer, connection_id, "connection reset by peer");
            }
            Err(AppError::DispatcherClosed) => {
                debug!(%peer, connection_id, "dispatcher closed, dropping connection");
            }
            Err(e) => error!(%peer, connection_id, "connection faulted: {}", e),
        }

        self.registry.remove(&peer);
        self.client.close().await;
    }

    /// Reads frames and forwards them until the peer closes, the stream faults,
    /// or the server shuts down.
    async fn receive_loop(&mut self) -> AppResult<()> {
        loop {
            let maybe_frame = tokio::select! {
                res = self.connection.read_frame() => res?,
                _ = self.shutdown.recv() => {
                    debug!("connection handler exit read loop after recv shutdown signal");
                    return Ok(());
                }
            };

            let frame = match maybe_frame {
                Some(frame) => frame,
                // client close the connection gracefully
                None => return Ok(()),
            };

            let unit = DispatchUnit {
                frame,
                client: self.client.clone(),
            };
            // a full pool queue blocks here; shutdown still has to get through
            tokio::select! {
                res = self.dispatcher.dispatch(&self.lane, unit) => res?,
                _ = self.shutdown.recv() => return Ok(()),
            }
        }
    }
}

impl<H: MessageHandler> Drop for SpaServer<H> {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}
