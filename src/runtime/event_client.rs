use super::RuntimeError;
use crate::orchestration::events::{decode_frame, ControlMessage, EventBody};
use std::collections::BTreeSet;
use std::io::{ErrorKind, Write};
use std::time::{Duration, Instant};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect, Message};

const CLIENT_READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    pub runs: Vec<String>,
    pub all: bool,
    /// Stop after this many run events.
    pub max_events: Option<usize>,
    /// Stop once every watched run has emitted its terminal event.
    pub until_terminal: bool,
    pub timeout: Option<Duration>,
}

impl WatchOptions {
    pub fn control_messages(&self) -> Vec<ControlMessage> {
        if self.all {
            return vec![ControlMessage::SubscribeAll];
        }
        self.runs
            .iter()
            .map(|run_id| ControlMessage::Subscribe {
                run_id: run_id.clone(),
            })
            .collect()
    }
}

/// Connects to an event server and writes every run event frame it receives
/// to `out`, one per line. Returns the number of run events written.
pub fn watch_events(
    addr: &str,
    options: &WatchOptions,
    out: &mut dyn Write,
) -> Result<usize, RuntimeError> {
    let url = if addr.starts_with("ws://") {
        addr.to_string()
    } else {
        format!("ws://{addr}/")
    };
    let (mut socket, _) = connect(url.as_str()).map_err(websocket_error)?;
    if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
        stream
            .set_read_timeout(Some(CLIENT_READ_TIMEOUT))
            .map_err(|source| RuntimeError::Io {
                path: url.clone(),
                source,
            })?;
    }
    for message in options.control_messages() {
        socket
            .send(Message::Text(message.encode()))
            .map_err(websocket_error)?;
    }

    let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
    let mut pending_terminal = options.runs.iter().cloned().collect::<BTreeSet<_>>();
    let mut written = 0usize;
    loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        if options.max_events.is_some_and(|max| written >= max) {
            break;
        }
        if options.until_terminal && !options.all && pending_terminal.is_empty() {
            break;
        }

        let text = match socket.read() {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(tungstenite::Error::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                break
            }
            Err(err) => return Err(websocket_error(err)),
        };
        let Ok(event) = decode_frame(text.as_str()) else {
            continue;
        };
        match &event.body {
            EventBody::Ping { .. } => {
                // any inbound message keeps the subscription alive
                socket
                    .send(Message::Text(ControlMessage::Ping.encode()))
                    .map_err(websocket_error)?;
                continue;
            }
            EventBody::Pong { .. } | EventBody::Connected { .. } => continue,
            _ => {}
        }
        writeln!(out, "{}", text.as_str()).map_err(|source| RuntimeError::Io {
            path: "watch output".to_string(),
            source,
        })?;
        let _ = out.flush();
        written += 1;
        if let (EventBody::Terminal { .. }, Some(run_id)) = (&event.body, event.run_id.as_ref()) {
            pending_terminal.remove(run_id);
        }
    }

    let _ = socket.close(None);
    Ok(written)
}

fn websocket_error(err: tungstenite::Error) -> RuntimeError {
    RuntimeError::WebSocket(err.to_string())
}
