// TCP transport session for a single motor
//
// One socket, two worker threads:
// - sender:   every SEND_INTERVAL encodes the commanded torque and writes it,
//             waking on an absolute schedule so write time does not drift
// - receiver: blocks in read(), decodes feedback and stores angle/omega
//
// Either worker failing sets the shared exit flag; the other one notices at
// its next iteration. A failed sender also shuts the socket down so the
// receiver does not stay parked in read().
//
// Shutdown order is: set flag, shut the socket down (this is what wakes a
// receiver blocked on a silent peer), then join.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use super::protocol::{COMMAND_FRAME_LEN, FeedbackFrame, FrameBuffer, MotorId, encode_command};
use super::state::MotorState;
use crate::config::SEND_INTERVAL;

const READ_CHUNK: usize = 256;

pub const MIN_SEND_INTERVAL: Duration = Duration::from_millis(1);

/// Error types for the motor link
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Address {addr} did not resolve to any socket address")]
    Resolve { addr: String },

    #[error("Connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Cross-thread coordination flags of a session
#[derive(Debug, Default)]
pub struct LinkStatus {
    connected: AtomicBool,
    should_exit: AtomicBool,
}

impl LinkStatus {
    /// True while the socket is open and neither worker has failed
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.should_exit.load(Ordering::Acquire)
    }

    fn exit_requested(&self) -> bool {
        self.should_exit.load(Ordering::Acquire)
    }

    fn request_exit(&self) {
        self.should_exit.store(true, Ordering::Release);
    }

    /// Called by a worker that hit a transport error
    fn fail(&self) {
        self.request_exit();
        self.connected.store(false, Ordering::Release);
    }
}

struct Link {
    stream: TcpStream,
    peer: SocketAddr,
    sender: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

/// Owns the socket and worker pair for one motor
pub struct TransportSession {
    state: Arc<MotorState>,
    status: Arc<LinkStatus>,
    send_interval: Duration,
    link: Option<Link>,
}

impl TransportSession {
    pub fn new(state: Arc<MotorState>) -> Self {
        Self::with_send_interval(state, SEND_INTERVAL)
    }

    /// Intervals below `MIN_SEND_INTERVAL` are raised to it
    pub fn with_send_interval(state: Arc<MotorState>, send_interval: Duration) -> Self {
        Self {
            state,
            status: Arc::new(LinkStatus::default()),
            send_interval: send_interval.max(MIN_SEND_INTERVAL),
            link: None,
        }
    }

    pub fn send_interval(&self) -> Duration {
        self.send_interval
    }

    pub fn motor_id(&self) -> MotorId {
        self.state.id()
    }

    pub fn status(&self) -> Arc<LinkStatus> {
        Arc::clone(&self.status)
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some() && self.status.is_connected()
    }

    /// Peer address of the live link, if any
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.as_ref().map(|link| link.peer)
    }

    /// Open the TCP link and start both workers.
    ///
    /// Returns immediately if already connected. A link whose workers have
    /// died is torn down first, so this also serves as an explicit reconnect.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if self.link.is_some() {
            debug!(motor_id = self.motor_id(), "Reaping failed link before reconnect");
            self.disconnect();
        }

        let addr = format!("{}:{}", host, port);
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|source| SessionError::Connect {
                addr: addr.clone(),
                source,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(SessionError::Resolve { addr });
        }

        let stream = TcpStream::connect(&addrs[..])
            .map_err(|source| SessionError::Connect { addr, source })?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;

        let tx_stream = stream.try_clone()?;
        let rx_stream = stream.try_clone()?;

        self.status.should_exit.store(false, Ordering::Release);
        self.status.connected.store(true, Ordering::Release);

        let sender = match self.spawn_sender(tx_stream) {
            Ok(handle) => handle,
            Err(e) => {
                self.status.fail();
                let _ = stream.shutdown(Shutdown::Both);
                return Err(e.into());
            }
        };
        let receiver = match self.spawn_receiver(rx_stream) {
            Ok(handle) => handle,
            Err(e) => {
                self.status.fail();
                let _ = stream.shutdown(Shutdown::Both);
                let _ = sender.join();
                return Err(e.into());
            }
        };

        info!(motor_id = self.motor_id(), %peer, "Motor link connected");
        self.link = Some(Link {
            stream,
            peer,
            sender,
            receiver,
        });
        Ok(())
    }

    /// Stop both workers and close the socket. No-op when not connected.
    pub fn disconnect(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };

        self.status.request_exit();
        // Wakes a receiver blocked on a peer that never sends
        if let Err(e) = link.stream.shutdown(Shutdown::Both) {
            debug!(motor_id = self.motor_id(), "Socket shutdown: {}", e);
        }

        if link.sender.join().is_err() {
            warn!(motor_id = self.motor_id(), "Sender thread panicked");
        }
        if link.receiver.join().is_err() {
            warn!(motor_id = self.motor_id(), "Receiver thread panicked");
        }

        self.status.connected.store(false, Ordering::Release);
        info!(motor_id = self.motor_id(), peer = %link.peer, "Motor link disconnected");
    }

    fn spawn_sender(&self, stream: TcpStream) -> io::Result<JoinHandle<()>> {
        let state = Arc::clone(&self.state);
        let status = Arc::clone(&self.status);
        let interval = self.send_interval;
        thread::Builder::new()
            .name(format!("motor{}-tx", state.id()))
            .spawn(move || send_loop(stream, &state, &status, interval))
    }

    fn spawn_receiver(&self, stream: TcpStream) -> io::Result<JoinHandle<()>> {
        let state = Arc::clone(&self.state);
        let status = Arc::clone(&self.status);
        thread::Builder::new()
            .name(format!("motor{}-rx", state.id()))
            .spawn(move || receive_loop(stream, &state, &status))
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn send_loop(mut stream: TcpStream, state: &MotorState, status: &LinkStatus, interval: Duration) {
    let id = state.id();
    let mut next_send = Instant::now();
    while !status.exit_requested() {
        let torque = state.torque();
        let packet = encode_command(id, torque);
        trace!(motor_id = id, torque, "Sending command");

        match stream.write(&packet) {
            Ok(COMMAND_FRAME_LEN) => {}
            Ok(n) => {
                warn!(motor_id = id, "Short write ({} of {} bytes)", n, COMMAND_FRAME_LEN);
                status.fail();
                let _ = stream.shutdown(Shutdown::Both);
                break;
            }
            Err(e) => {
                if !status.exit_requested() {
                    warn!(motor_id = id, "Send failed: {}", e);
                }
                status.fail();
                let _ = stream.shutdown(Shutdown::Both);
                break;
            }
        }

        next_send += interval;
        let now = Instant::now();
        if now >= next_send {
            // Behind schedule: drop the missed slots, never burst
            while next_send <= now {
                next_send += interval;
            }
            trace!(motor_id = id, "Send slot missed");
        }
        thread::sleep(next_send - now);
    }
    debug!(motor_id = id, "Sender stopped");
}

fn receive_loop(mut stream: TcpStream, state: &MotorState, status: &LinkStatus) {
    let id = state.id();
    let mut rx = FrameBuffer::<FeedbackFrame>::new();
    let mut chunk = [0u8; READ_CHUNK];

    while !status.exit_requested() {
        let n = match stream.read(&mut chunk) {
            Ok(0) => {
                if !status.exit_requested() {
                    warn!(motor_id = id, "Peer closed the connection");
                }
                status.fail();
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if !status.exit_requested() {
                    warn!(motor_id = id, "Receive failed: {}", e);
                }
                status.fail();
                break;
            }
        };

        for frame in rx.push(&chunk[..n]) {
            if frame.motor_id != id {
                trace!(motor_id = id, frame_id = frame.motor_id, "Ignoring feedback for another motor");
                continue;
            }
            state.record_feedback(frame.angle, frame.omega);
        }
    }
    debug!(motor_id = id, discarded = rx.discarded(), "Receiver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_interval_has_floor() {
        let state = Arc::new(MotorState::new(0));
        let session = TransportSession::with_send_interval(Arc::clone(&state), Duration::ZERO);
        assert_eq!(session.send_interval(), MIN_SEND_INTERVAL);

        let session = TransportSession::new(state);
        assert_eq!(session.send_interval(), SEND_INTERVAL);
        assert!(!session.is_connected());
    }
}
