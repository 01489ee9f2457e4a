//! Blocking TCP listener that runs on its own thread.
//!
//! The accept loop polls a non-blocking loopback socket, reads one request
//! per connection, answers with a fixed JSON acknowledgment and closes the
//! connection. Parsed requests are pushed onto a bounded queue; the thread
//! never touches the owner's state.

use super::request::{exceeds_limit, is_complete, parse_request, InboundRequest};
use crate::config::ListenerConfig;
use crate::{port, BeaconError, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long a single connection may take to deliver its request.
const CONNECTION_DEADLINE: Duration = Duration::from_secs(5);

/// Grace period after force-closing the in-flight connection.
const FORCE_STOP_GRACE: Duration = Duration::from_millis(500);

/// State shared between the owner and the accept thread.
struct Shared {
    running: AtomicBool,
    /// Clone of the connection currently being served, so `stop()` can
    /// shut it down and unblock a pending read.
    active: Mutex<Option<TcpStream>>,
    sink: mpsc::Sender<InboundRequest>,
}

impl Shared {
    fn set_active(&self, stream: Option<TcpStream>) {
        if let Ok(mut active) = self.active.lock() {
            *active = stream;
        }
    }

    fn interrupt_active(&self) {
        let stream = self.active.lock().ok().and_then(|mut active| active.take());
        if let Some(stream) = stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Inbound HTTP listener bound to a loopback port.
pub struct CommandListener {
    shared: Arc<Shared>,
    port: Option<u16>,
    thread: Option<JoinHandle<()>>,
    exited_rx: Option<std_mpsc::Receiver<()>>,
}

impl CommandListener {
    /// Create a stopped listener that will deliver requests to `sink`.
    pub fn new(sink: mpsc::Sender<InboundRequest>) -> Self {
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                active: Mutex::new(None),
                sink,
            }),
            port: None,
            thread: None,
            exited_rx: None,
        }
    }

    /// The accept thread is alive and has not been told to stop.
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
            && self.shared.running.load(Ordering::SeqCst)
    }

    /// Port the listener is bound to while running.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Bind `port` on loopback and spawn the accept thread.
    pub fn start(&mut self, port: u16) -> Result<()> {
        let bind_err = |message: String| BeaconError::ListenerBind { port, message };

        if self.thread.is_some() {
            return Err(bind_err(format!(
                "listener already running on port {}",
                self.port.unwrap_or_default()
            )));
        }
        if !port::is_available(i32::from(port)) {
            return Err(bind_err("port is not available".to_string()));
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .map_err(|e| bind_err(e.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| bind_err(e.to_string()))?;

        self.shared.running.store(true, Ordering::SeqCst);
        let (exited_tx, exited_rx) = std_mpsc::channel();
        let shared = Arc::clone(&self.shared);

        let handle = thread::Builder::new()
            .name(format!("beacon-listener-{}", port))
            .spawn(move || {
                accept_loop(listener, &shared);
                let _ = exited_tx.send(());
            })
            .map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                bind_err(format!("failed to spawn accept thread: {}", e))
            })?;

        self.thread = Some(handle);
        self.exited_rx = Some(exited_rx);
        self.port = Some(port);
        info!("Command listener started on 127.0.0.1:{}", port);
        Ok(())
    }

    /// Stop the accept thread. Safe to call repeatedly.
    ///
    /// Waits up to [`ListenerConfig::JOIN_TIMEOUT`] for the thread to exit;
    /// after that the in-flight connection is shut down, and if the thread
    /// still does not exit it is detached.
    pub fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        self.shared.running.store(false, Ordering::SeqCst);
        let port = self.port.take().unwrap_or_default();

        let exited = match self.exited_rx.take() {
            Some(rx) => match rx.recv_timeout(ListenerConfig::JOIN_TIMEOUT) {
                Err(std_mpsc::RecvTimeoutError::Timeout) => {
                    warn!(
                        "Listener thread on port {} did not stop in {:?}, closing its connection",
                        port,
                        ListenerConfig::JOIN_TIMEOUT
                    );
                    self.shared.interrupt_active();
                    rx.recv_timeout(FORCE_STOP_GRACE).is_ok()
                }
                // Sent, or the sender was dropped because the thread is gone.
                _ => true,
            },
            None => true,
        };

        if exited {
            if handle.join().is_err() {
                warn!("Listener thread on port {} panicked", port);
            }
            info!("Command listener on port {} stopped", port);
        } else {
            warn!("Detaching unresponsive listener thread on port {}", port);
        }
    }
}

impl Drop for CommandListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, shared: &Shared) {
    while shared.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("Listener connection from {}", peer);
                serve_connection(stream, shared);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ListenerConfig::IDLE_POLL_INTERVAL);
            }
            Err(e) => {
                warn!("Listener accept error: {}", e);
                thread::sleep(ListenerConfig::IDLE_POLL_INTERVAL);
            }
        }
    }
    // Dropping `listener` here releases the port.
}

fn serve_connection(mut stream: TcpStream, shared: &Shared) {
    if stream.set_nonblocking(false).is_err()
        || stream
            .set_read_timeout(Some(ListenerConfig::READ_POLL_TIMEOUT))
            .is_err()
    {
        return;
    }
    shared.set_active(stream.try_clone().ok());

    let raw = read_request(&mut stream, shared);
    shared.set_active(None);

    let Some(raw) = raw else {
        return;
    };
    let Some(request) = parse_request(&raw) else {
        debug!("Dropping malformed request ({} bytes)", raw.len());
        return;
    };

    debug!("Received {} {}", request.method, request.path);
    match shared.sink.try_send(request) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(request)) => {
            warn!(
                "Request queue full, dropping {} {}",
                request.method, request.path
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Request queue closed, owner has gone away");
        }
    }

    if let Err(e) = write_ack(&mut stream) {
        debug!("Failed to write acknowledgment: {}", e);
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// Read until headers and any declared body are in, enforcing the size cap.
fn read_request(stream: &mut TcpStream, shared: &Shared) -> Option<Vec<u8>> {
    let started = Instant::now();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        if !shared.running.load(Ordering::SeqCst) || started.elapsed() > CONNECTION_DEADLINE {
            return None;
        }
        match stream.read(&mut chunk) {
            Ok(0) => return None,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if exceeds_limit(&buf, ListenerConfig::MAX_REQUEST_BYTES) {
                    warn!(
                        "Request exceeds {} bytes, dropping connection",
                        ListenerConfig::MAX_REQUEST_BYTES
                    );
                    return None;
                }
                if is_complete(&buf) {
                    return Some(buf);
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("Listener read error: {}", e);
                return None;
            }
        }
    }
}

fn write_ack(stream: &mut TcpStream) -> std::io::Result<()> {
    let body = ListenerConfig::ACK_BODY;
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()
}
