use super::RuntimeError;
use crate::orchestration::events::{encode_frame, ControlMessage};
use crate::orchestration::hub::{
    EventHub, SubscriptionError, SubscriptionFilter, SubscriptionHandle,
};
use crate::shared::logging::Logger;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tungstenite::{Message, WebSocket};

const ACCEPT_IDLE_SLEEP: Duration = Duration::from_millis(25);
const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(20);
const SOCKET_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_FRAMES_PER_TURN: usize = 64;

/// WebSocket endpoint that bridges hub subscriptions to remote clients.
///
/// Each connection starts with an empty filter and is driven by one thread
/// that alternates between draining its subscription and reading control
/// messages.
pub struct EventServer {
    listener: TcpListener,
    hub: EventHub,
    logger: Logger,
}

impl EventServer {
    pub fn bind(addr: &str, hub: EventHub, logger: Logger) -> Result<Self, RuntimeError> {
        let listener = TcpListener::bind(addr).map_err(|source| RuntimeError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| RuntimeError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            hub,
            logger,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RuntimeError> {
        self.listener.local_addr().map_err(|source| RuntimeError::Io {
            path: "event server listener".to_string(),
            source,
        })
    }

    pub fn spawn(self, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>, RuntimeError> {
        thread::Builder::new()
            .name("runcast-event-server".to_string())
            .spawn(move || self.serve(&stop))
            .map_err(|source| RuntimeError::Spawn {
                what: "event server".to_string(),
                source,
            })
    }

    /// Accepts connections until `stop` is raised, then waits for every
    /// connection thread to finish.
    pub fn serve(self, stop: &Arc<AtomicBool>) {
        let mut connections: Vec<JoinHandle<()>> = Vec::new();
        while !stop.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let hub = self.hub.clone();
                    let logger = self.logger.clone();
                    let stop = Arc::clone(stop);
                    let spawned = thread::Builder::new()
                        .name(format!("runcast-conn-{peer}"))
                        .spawn(move || serve_connection(stream, peer, &hub, &logger, &stop));
                    match spawned {
                        Ok(handle) => connections.push(handle),
                        Err(err) => self
                            .logger
                            .error("server.connection.spawn_failed", format!("peer={peer} error={err}")),
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_IDLE_SLEEP);
                }
                Err(err) => {
                    self.logger
                        .warn("server.accept.failed", err.to_string());
                    thread::sleep(ACCEPT_IDLE_SLEEP);
                }
            }
            connections.retain(|handle| !handle.is_finished());
        }
        for handle in connections {
            let _ = handle.join();
        }
        self.logger.info("server.stopped", "event server stopped");
    }
}

fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: &EventHub,
    logger: &Logger,
    stop: &AtomicBool,
) {
    if let Err(err) = stream.set_nonblocking(false) {
        logger.warn("server.connection.rejected", format!("peer={peer} error={err}"));
        return;
    }
    let mut socket = match tungstenite::accept(stream) {
        Ok(socket) => socket,
        Err(err) => {
            logger.warn("server.handshake.failed", format!("peer={peer} error={err}"));
            return;
        }
    };
    let timeouts = socket
        .get_ref()
        .set_read_timeout(Some(SOCKET_READ_TIMEOUT))
        .and_then(|()| socket.get_ref().set_write_timeout(Some(SOCKET_WRITE_TIMEOUT)));
    if let Err(err) = timeouts {
        logger.warn("server.connection.rejected", format!("peer={peer} error={err}"));
        return;
    }
    let subscription = match hub.register(SubscriptionFilter::none()) {
        Ok(subscription) => subscription,
        Err(err) => {
            logger.warn("server.connection.rejected", format!("peer={peer} error={err}"));
            let _ = socket.close(None);
            return;
        }
    };
    let handle = subscription.handle();
    logger.info(
        "server.connection.opened",
        format!("peer={peer} subscriber={}", handle.id()),
    );

    let mut close_reason = "client closed".to_string();
    let mut write_broken = false;
    'connection: loop {
        if stop.load(Ordering::Relaxed) {
            close_reason = "server stopping".to_string();
            break;
        }

        // only inbound frames refresh the idle clock
        for _ in 0..MAX_FRAMES_PER_TURN {
            if stop.load(Ordering::Relaxed) {
                close_reason = "server stopping".to_string();
                break 'connection;
            }
            match subscription.try_recv_quiet() {
                Ok(Some(event)) => {
                    let frame = match encode_frame(&event) {
                        Ok(frame) => frame,
                        Err(err) => {
                            logger.error("server.frame.encode_failed", err.to_string());
                            continue;
                        }
                    };
                    // a stalled peer surfaces as a write timeout
                    if let Err(err) = socket.send(Message::Text(frame)) {
                        write_broken = true;
                        close_reason = match &err {
                            tungstenite::Error::Io(io) if is_timeout(io) => {
                                "write stalled".to_string()
                            }
                            _ => format!("write failed: {err}"),
                        };
                        break 'connection;
                    }
                }
                Ok(None) => break,
                Err(SubscriptionError::Closed(reason)) => {
                    close_reason = format!("evicted: {reason}");
                    break 'connection;
                }
                Err(SubscriptionError::Timeout) => break,
            }
        }

        match socket.read() {
            Ok(Message::Text(text)) => {
                handle.touch();
                apply_control(&handle, text.as_str());
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {
                handle.touch();
            }
            Ok(Message::Frame(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(tungstenite::Error::Io(err)) if is_timeout(&err) => {}
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                break
            }
            Err(err) => {
                close_reason = format!("read failed: {err}");
                break;
            }
        }
    }

    handle.unregister();
    if write_broken {
        let _ = socket.get_ref().shutdown(Shutdown::Both);
    } else {
        close_socket(&mut socket);
    }
    logger.info(
        "server.connection.closed",
        format!("peer={peer} subscriber={} reason={close_reason}", handle.id()),
    );
}

fn apply_control(handle: &SubscriptionHandle, raw: &str) {
    let Some(message) = ControlMessage::parse(raw) else {
        return;
    };
    match message {
        ControlMessage::Subscribe { run_id } => handle.update_filter(|filter| {
            filter.runs.insert(run_id);
        }),
        ControlMessage::Unsubscribe { run_id } => handle.update_filter(|filter| {
            filter.runs.remove(&run_id);
        }),
        ControlMessage::SubscribeAll => handle.update_filter(|filter| filter.all = true),
        ControlMessage::UnsubscribeAll => handle.update_filter(|filter| {
            filter.all = false;
            filter.runs.clear();
        }),
        ControlMessage::Ping => {
            handle.reply_pong();
        }
    }
}

fn close_socket(socket: &mut WebSocket<TcpStream>) {
    let _ = socket.close(None);
    // drain until the peer acknowledges or the read times out
    for _ in 0..5 {
        match socket.read() {
            Ok(_) => continue,
            Err(tungstenite::Error::Io(err)) if is_timeout(&err) => continue,
            Err(_) => break,
        }
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
