//! Loopback listener that accepts exactly one test host connection.

use std::io::{self, BufReader};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::error::CommunicationError;
use crate::io::channel::{CommunicationChannel, DEFAULT_MAX_FRAME_BYTES, LengthPrefixChannel};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub type ConnectedCallback = Box<dyn Fn(Arc<dyn CommunicationChannel>) + Send + Sync>;
pub type DisconnectedCallback = Box<dyn Fn(Option<&CommunicationError>) + Send + Sync>;

/// Subscribers for one listening session.
pub struct ServerCallbacks {
    /// Raised on the server thread once the client is accepted.
    pub on_connected: ConnectedCallback,
    /// Raised once when the read loop ends: `None` if it ended because of `stop`.
    pub on_disconnected: DisconnectedCallback,
}

pub trait CommunicationServer: Send + Sync {
    /// Start listening; returns the connection string (the port).
    fn start(&self, callbacks: ServerCallbacks) -> Result<String, CommunicationError>;

    /// Stop listening and unblock the read loop. Never fails; idempotent.
    fn stop(&self);
}

#[derive(Default)]
struct Session {
    stop: AtomicBool,
    finished: AtomicBool,
    stream: Mutex<Option<TcpStream>>,
    channel: Mutex<Option<Arc<LengthPrefixChannel>>>,
}

impl Session {
    fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if let Ok(mut stream) = self.stream.lock()
            && let Some(stream) = stream.take()
            && let Err(err) = stream.shutdown(Shutdown::Both)
        {
            debug!(err = %err, "socket already closed");
        }
        if let Ok(channel) = self.channel.lock()
            && let Some(channel) = channel.as_ref()
        {
            channel.dispose();
        }
    }
}

/// [`CommunicationServer`] over a TCP socket bound to `127.0.0.1`.
pub struct SocketServer {
    max_frame_bytes: usize,
    session: Mutex<Option<Arc<Session>>>,
}

impl Default for SocketServer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl SocketServer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            session: Mutex::new(None),
        }
    }
}

impl CommunicationServer for SocketServer {
    #[instrument(skip_all)]
    fn start(&self, callbacks: ServerCallbacks) -> Result<String, CommunicationError> {
        let mut current = self
            .session
            .lock()
            .map_err(|_| CommunicationError::Disposed)?;
        if let Some(session) = current.as_ref()
            && !session.finished.load(Ordering::Acquire)
        {
            return Err(CommunicationError::AlreadyListening);
        }

        let listener = TcpListener::bind("127.0.0.1:0").map_err(CommunicationError::Listen)?;
        listener
            .set_nonblocking(true)
            .map_err(CommunicationError::Listen)?;
        let port = listener
            .local_addr()
            .map_err(CommunicationError::Listen)?
            .port();

        let session = Arc::new(Session::default());
        let worker = Arc::clone(&session);
        let max_frame_bytes = self.max_frame_bytes;
        thread::Builder::new()
            .name("hostlink-server".to_string())
            .spawn(move || {
                serve(listener, &worker, &callbacks, max_frame_bytes);
                worker.finished.store(true, Ordering::Release);
            })
            .map_err(CommunicationError::Listen)?;

        *current = Some(session);
        info!(port, "listening for test host");
        Ok(port.to_string())
    }

    fn stop(&self) {
        let session = match self.session.lock() {
            Ok(mut current) => current.take(),
            Err(_) => None,
        };
        if let Some(session) = session {
            debug!("stopping server");
            session.shutdown();
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(
    listener: TcpListener,
    session: &Session,
    callbacks: &ServerCallbacks,
    max_frame_bytes: usize,
) {
    let stream = match accept_one(&listener, session) {
        Ok(Some(stream)) => stream,
        Ok(None) => {
            debug!("stopped before a client connected");
            return;
        }
        Err(err) => {
            error!(err = %err, "accept failed");
            (callbacks.on_disconnected)(Some(&CommunicationError::Listen(err)));
            return;
        }
    };
    drop(listener);

    let channel = match wrap_stream(stream, session, max_frame_bytes) {
        Ok(Some(channel)) => channel,
        Ok(None) => return,
        Err(err) => {
            error!(err = %err, "failed to set up accepted connection");
            (callbacks.on_disconnected)(Some(&CommunicationError::Listen(err)));
            return;
        }
    };

    info!("test host connected");
    (callbacks.on_connected)(Arc::clone(&channel) as Arc<dyn CommunicationChannel>);

    loop {
        if let Err(err) = channel.notify_data_available() {
            channel.dispose();
            if session.stop.load(Ordering::Acquire) {
                debug!("read loop stopped");
                (callbacks.on_disconnected)(None);
            } else {
                warn!(err = %err, "test host disconnected");
                (callbacks.on_disconnected)(Some(&err));
            }
            return;
        }
    }
}

fn accept_one(listener: &TcpListener, session: &Session) -> io::Result<Option<TcpStream>> {
    loop {
        if session.stop.load(Ordering::Acquire) {
            return Ok(None);
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                return Ok(Some(stream));
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}

fn wrap_stream(
    stream: TcpStream,
    session: &Session,
    max_frame_bytes: usize,
) -> io::Result<Option<Arc<LengthPrefixChannel>>> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let reader = stream.try_clone()?;
    let writer = stream.try_clone()?;
    {
        let mut slot = session
            .stream
            .lock()
            .map_err(|_| io::Error::other("server state poisoned"))?;
        *slot = Some(stream);
    }
    if session.stop.load(Ordering::Acquire) {
        session.shutdown();
        return Ok(None);
    }

    let channel = Arc::new(LengthPrefixChannel::new(
        BufReader::new(reader),
        writer,
        max_frame_bytes,
    ));
    if let Ok(mut slot) = session.channel.lock() {
        *slot = Some(Arc::clone(&channel));
    }
    Ok(Some(channel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::channel::{read_frame, write_frame};
    use std::sync::mpsc;

    #[derive(Debug, PartialEq)]
    enum Event {
        Connected,
        Message(String),
        Disconnected(Option<String>),
    }

    fn recording_callbacks(tx: mpsc::Sender<Event>) -> ServerCallbacks {
        let on_message = tx.clone();
        let on_disconnect = Mutex::new(tx.clone());
        let on_connect = Mutex::new(tx);
        ServerCallbacks {
            on_connected: Box::new(move |channel| {
                let sink = Mutex::new(on_message.clone());
                channel.set_message_received(Some(Arc::new(move |data: &str| {
                    let _ = sink.lock().expect("lock").send(Event::Message(data.to_string()));
                })));
                channel.send("welcome").expect("send welcome");
                let _ = on_connect.lock().expect("lock").send(Event::Connected);
            }),
            on_disconnected: Box::new(move |err| {
                let _ = on_disconnect
                    .lock()
                    .expect("lock")
                    .send(Event::Disconnected(err.map(ToString::to_string)));
            }),
        }
    }

    fn recv(rx: &mpsc::Receiver<Event>) -> Event {
        rx.recv_timeout(Duration::from_secs(5)).expect("event")
    }

    #[test]
    fn exchanges_frames_and_reports_peer_close() {
        let server = SocketServer::default();
        let (tx, rx) = mpsc::channel();
        let port: u16 = server
            .start(recording_callbacks(tx))
            .expect("start")
            .parse()
            .expect("port");

        let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        assert_eq!(recv(&rx), Event::Connected);
        let greeting = read_frame(&mut client, DEFAULT_MAX_FRAME_BYTES).expect("read");
        assert_eq!(greeting.as_deref(), Some("welcome"));

        write_frame(&mut client, "ping").expect("write");
        assert_eq!(recv(&rx), Event::Message("ping".to_string()));

        drop(client);
        assert_eq!(
            recv(&rx),
            Event::Disconnected(Some("connection closed by remote peer".to_string()))
        );
        server.stop();
    }

    #[test]
    fn stop_reports_disconnect_without_error() {
        let server = SocketServer::default();
        let (tx, rx) = mpsc::channel();
        let port: u16 = server
            .start(recording_callbacks(tx))
            .expect("start")
            .parse()
            .expect("port");
        let _client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        assert_eq!(recv(&rx), Event::Connected);

        server.stop();
        server.stop();
        assert_eq!(recv(&rx), Event::Disconnected(None));
    }

    #[test]
    fn second_start_while_listening_is_rejected() {
        let server = SocketServer::default();
        let (tx, _rx) = mpsc::channel();
        server.start(recording_callbacks(tx.clone())).expect("start");
        let err = server.start(recording_callbacks(tx)).unwrap_err();
        assert!(matches!(err, CommunicationError::AlreadyListening));
    }

    #[test]
    fn can_listen_again_after_stop() {
        let server = SocketServer::default();
        let (tx, _rx) = mpsc::channel();
        server.start(recording_callbacks(tx.clone())).expect("first start");
        server.stop();
        server.start(recording_callbacks(tx)).expect("second start");
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        SocketServer::default().stop();
    }
}
