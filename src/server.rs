//! TCP front end: accepts clients, frames request lines, dispatches
//! commands against the registry, and emits monitor pushes.
//!
//! Every client gets its own cooperative task running a framed line loop;
//! the simulation ticker is one more task in the same set. Under the
//! binary's current-thread runtime they all interleave on a single
//! thread, so a session never observes a half-applied tick.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::{JoinHandle, JoinSet},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::{
    codec::{Framed, LinesCodec, LinesCodecError},
    sync::CancellationToken,
};
use tracing::{debug, error, info, warn};

use crate::{
    protocol::{self, CMD_BUFFER_SIZE, Command, ErrorCode, RESPONSE_BUFFER_SIZE, Response},
    registry::Registry,
    utils,
};

/// Listen backlog for the TCP socket.
pub const BACKLOG: i32 = 10;
/// Default cap on simultaneous client sessions; connections beyond it
/// are accepted and immediately closed.
pub const MAX_CLIENTS: usize = 32;
/// Default simulation tick period.
pub const TICK_PERIOD: Duration = Duration::from_millis(10);

/// Registry shared between the ticker and every client session.
pub type SharedRegistry = Arc<Mutex<Registry>>;

/// Construct a [`ServerHandle`] by setting up multiple aspects before
/// running.
pub struct ServerBuilder {
    port: u16,
    max_clients: usize,
    tick_period: Duration,
    registry: SharedRegistry,
    cancellation_token: CancellationToken,
}

impl ServerBuilder {
    pub fn new(registry: Registry) -> ServerBuilder {
        ServerBuilder {
            port: utils::get_default_server_port(),
            max_clients: MAX_CLIENTS,
            tick_period: TICK_PERIOD,
            registry: Arc::new(Mutex::new(registry)),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Port to listen on; 0 asks the OS for a free one.
    pub fn port(mut self, port: u16) -> ServerBuilder {
        self.port = port;
        self
    }

    pub fn max_clients(mut self, max_clients: usize) -> ServerBuilder {
        self.max_clients = max_clients;
        self
    }

    pub fn tick_period(mut self, period: Duration) -> ServerBuilder {
        self.tick_period = period;
        self
    }

    pub fn cancellation_token(mut self, cancel: CancellationToken) -> ServerBuilder {
        self.cancellation_token = cancel;
        self
    }

    /// Bind the listener and launch the server. Failure to create or
    /// bind the socket is fatal and surfaces here.
    pub async fn start(self) -> io::Result<ServerHandle> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        let listener = utils::new_reusable_tcp_listener(addr, BACKLOG)?;
        let local_port = listener.local_addr()?.port();

        let server = Server {
            registry: self.registry.clone(),
            max_clients: self.max_clients,
            tick_period: self.tick_period,
            shutdown: self.cancellation_token.clone(),
            tasks: JoinSet::new(),
        };
        let handle = tokio::spawn(server.listen(listener));

        Ok(ServerHandle {
            cancel: self.cancellation_token,
            handle,
            registry: self.registry,
            local_port,
        })
    }
}

/// Owner handle for a running server.
pub struct ServerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<io::Result<()>>,
    registry: SharedRegistry,
    local_port: u16,
}

impl ServerHandle {
    /// The port the listener actually bound.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// The registry the server is serving.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub async fn join(&mut self) -> io::Result<()> {
        (&mut self.handle).await.unwrap()
    }

    /// Disconnect every session, stop the ticker, close the listener.
    pub async fn stop(mut self) -> io::Result<()> {
        self.cancel.cancel();
        self.join().await
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Server {
    registry: SharedRegistry,
    max_clients: usize,
    tick_period: Duration,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl Server {
    async fn listen(mut self, listener: TcpListener) -> io::Result<()> {
        self.spawn_ticker();

        let mut sessions = JoinSet::new();
        let mut next_id: u64 = 0;
        loop {
            let accepted = select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(x) => x,
                Err(e) => {
                    warn!("failed to accept incoming connection: {e}");
                    continue;
                }
            };
            // Reap finished sessions so their slots come back.
            while sessions.try_join_next().is_some() {}
            if sessions.len() >= self.max_clients {
                warn!("client table full ({} sessions), dropping {peer}", sessions.len());
                drop(stream);
                continue;
            }
            let id = next_id;
            next_id += 1;
            let registry = self.registry.clone();
            let cancel = self.shutdown.clone();
            sessions.spawn(async move { Session::start(id, stream, registry, cancel).await });
        }

        // Shutdown: sessions observe the token and wind down.
        while sessions.join_next().await.is_some() {}
        while self.tasks.join_next().await.is_some() {}
        debug!("listener closed");
        Ok(())
    }

    /// Advance the simulation on a fixed cadence, passing the measured
    /// elapsed time so motion speed is immune to tick jitter.
    fn spawn_ticker(&mut self) {
        let registry = self.registry.clone();
        let cancel = self.shutdown.clone();
        let period = self.tick_period;
        self.tasks.spawn(async move {
            let mut clock = time::interval(period);
            clock.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = Instant::now();
            loop {
                let now = select! {
                    _ = cancel.cancelled() => break,
                    now = clock.tick() => now,
                };
                let dt = now.duration_since(last).as_secs_f64();
                last = now;
                registry.lock().unwrap().update(dt);
            }
        });
    }
}

/// At most one subscription per session; a new MONITOR replaces it.
struct MonitorState {
    target: String,
    interval: Duration,
    next_push: Instant,
}

#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    KeepOpen,
    Close,
}

struct Session {
    id: u64,
    registry: SharedRegistry,
    monitor: Option<MonitorState>,
}

impl Session {
    async fn start(id: u64, stream: TcpStream, registry: SharedRegistry, cancel: CancellationToken) {
        match stream.peer_addr() {
            Ok(peer) => info!("{id}: client connected from {peer}"),
            Err(_) => info!("{id}: client connected"),
        }
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(CMD_BUFFER_SIZE));
        let mut session = Session {
            id,
            registry,
            monitor: None,
        };

        loop {
            let deadline = session.monitor.as_ref().map(|m| m.next_push);
            select! {
                _ = cancel.cancelled() => break,
                line = framed.next() => {
                    let line = match line {
                        None => {
                            debug!("{id}: peer closed connection");
                            break;
                        }
                        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                            warn!("{id}: request exceeded {CMD_BUFFER_SIZE} bytes without a newline, dropping client");
                            break;
                        }
                        Some(Err(LinesCodecError::Io(e))) => {
                            error!("{id}: recv failed: {e}");
                            break;
                        }
                        Some(Ok(line)) => line,
                    };
                    let (response, disposition) = session.execute(&line);
                    if let Err(e) = framed.send(response.render()).await {
                        error!("{id}: send failed: {e}");
                        break;
                    }
                    if disposition == Disposition::Close {
                        debug!("{id}: client quit");
                        break;
                    }
                }
                _ = wait_until(deadline) => {
                    if let Err(e) = session.push_monitor(&mut framed).await {
                        error!("{id}: monitor push failed: {e}");
                        break;
                    }
                }
            }
        }
        info!("{id}: client disconnected");
        // Dropping the framed stream closes the socket and discards any
        // unframed bytes.
    }

    fn execute(&mut self, line: &str) -> (Response, Disposition) {
        use Disposition::{Close, KeepOpen};

        let command = match protocol::parse(line) {
            Ok(command) => command,
            Err(e) => {
                debug!("{}: rejecting request: {e}", self.id);
                return (Response::Err(ErrorCode::UnknownCmd), KeepOpen);
            }
        };
        match command {
            Command::Ping => (Response::ok_with("PONG"), KeepOpen),
            Command::Quit => (Response::ok_with("BYE"), Close),
            Command::Get { target } => match self.registry.lock().unwrap().get(&target) {
                Some(value) => (Response::ok_with(utils::format_value(value)), KeepOpen),
                None => (Response::Err(ErrorCode::UnknownPv), KeepOpen),
            },
            Command::Put { target, value } => {
                use crate::registry::WriteError;
                match self.registry.lock().unwrap().set(&target, value) {
                    Ok(()) => (Response::ok_with("PUT"), KeepOpen),
                    Err(WriteError::UnknownPv) => (Response::Err(ErrorCode::UnknownPv), KeepOpen),
                    Err(WriteError::ReadOnly | WriteError::OutOfRange) => {
                        (Response::Err(ErrorCode::InvalidValue), KeepOpen)
                    }
                }
            }
            Command::Monitor {
                target,
                interval_ms,
            } => {
                // A missing PV is accepted here; the pushes just skip it.
                let interval = Duration::from_millis(interval_ms);
                self.monitor = Some(MonitorState {
                    target,
                    interval,
                    next_push: Instant::now() + interval,
                });
                (Response::ok_with("MONITORING"), KeepOpen)
            }
            Command::Stop => {
                self.monitor = None;
                (Response::ok_with("STOPPED"), KeepOpen)
            }
            Command::List { pattern } => {
                let capacity = RESPONSE_BUFFER_SIZE - "OK:".len() - 1;
                let (names, _count) = self
                    .registry
                    .lock()
                    .unwrap()
                    .list(pattern.as_deref().unwrap_or(""), capacity);
                (Response::ok_with(names), KeepOpen)
            }
            Command::Move { target, value } => {
                if self.registry.lock().unwrap().motor_move(&target, value) {
                    (Response::ok_with("MOVING"), KeepOpen)
                } else {
                    (Response::Err(ErrorCode::InvalidValue), KeepOpen)
                }
            }
            Command::Status { target } => {
                let label = self
                    .registry
                    .lock()
                    .unwrap()
                    .find_motor(&target)
                    .map(|motor| motor.status_label());
                match label {
                    Some(label) => (Response::ok_with(label), KeepOpen),
                    None => (Response::Err(ErrorCode::UnknownPv), KeepOpen),
                }
            }
        }
    }

    /// Emit one DATA push if the target still exists, then advance the
    /// deadline by one interval either way. Pushes are never batched to
    /// catch up.
    async fn push_monitor(
        &mut self,
        framed: &mut Framed<TcpStream, LinesCodec>,
    ) -> Result<(), LinesCodecError> {
        let Some(monitor) = self.monitor.as_mut() else {
            return Ok(());
        };
        monitor.next_push += monitor.interval;
        let target = monitor.target.clone();
        let value = self.registry.lock().unwrap().get(&target);
        if let Some(value) = value {
            framed.send(Response::Data(value).render()).await?;
        }
        Ok(())
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
