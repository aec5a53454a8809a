//! OSC message receiver: one listener thread per bound port, dispatching
//! to registered address handlers and optionally recording a "learning
//! mode" trace of everything that comes in.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rosc::{OscPacket, OscType};
use tracing::{debug, warn};

use crate::error::{TransportError, TransportResult};

/// A decoded OSC message, flattened for handler dispatch.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub address: String,
    pub args: Vec<OscType>,
}

/// An address/argument pair captured while learning mode is enabled.
#[derive(Debug, Clone)]
pub struct LearnedPattern {
    pub address: String,
    pub last_args: Vec<OscType>,
    pub receive_count: u64,
}

type Handler = Box<dyn Fn(&ReceivedMessage) + Send + Sync>;

struct Shared {
    handlers: Mutex<Vec<(String, Handler)>>,
    learning: AtomicBool,
    learned: Mutex<Vec<LearnedPattern>>,
    running: AtomicBool,
}

/// Listens on a single UDP port for incoming OSC traffic.
pub struct OscReceiver {
    socket: UdpSocket,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl OscReceiver {
    pub fn bind(port: u16) -> TransportResult<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).map_err(|source| TransportError::BindError {
            addr: format!("0.0.0.0:{port}"),
            source,
        })?;
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .map_err(TransportError::Socket)?;

        Ok(Self {
            socket,
            shared: Arc::new(Shared {
                handlers: Mutex::new(Vec::new()),
                learning: AtomicBool::new(false),
                learned: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        })
    }

    /// Register a handler for an exact address, e.g. `/cv/1`. Multiple
    /// handlers on the same address all run, in registration order.
    pub fn register_handler<F>(&self, address: impl Into<String>, handler: F)
    where
        F: Fn(&ReceivedMessage) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .lock()
            .expect("handler lock poisoned")
            .push((address.into(), Box::new(handler)));
    }

    pub fn set_learning_mode(&self, enabled: bool) {
        self.shared.learning.store(enabled, Ordering::SeqCst);
        if enabled {
            self.shared.learned.lock().expect("learned lock poisoned").clear();
        }
    }

    pub fn drain_learned_patterns(&self) -> Vec<LearnedPattern> {
        std::mem::take(&mut *self.shared.learned.lock().expect("learned lock poisoned"))
    }

    /// Spawn the listener thread. Calling `start` twice is a no-op.
    pub fn start(&self) -> TransportResult<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let socket = self.socket.try_clone().map_err(TransportError::Socket)?;
        let shared = Arc::clone(&self.shared);

        let handle = thread::Builder::new()
            .name("cvosc-osc-receiver".into())
            .spawn(move || receive_loop(socket, shared))
            .expect("failed to spawn OSC receiver thread");

        *self.thread.lock().expect("thread lock poisoned") = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().expect("thread lock poisoned").take() {
            handle.join().ok();
        }
    }

    /// The bound port, useful when `bind(0)` was used to get an ephemeral one.
    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().expect("bound socket has a local address").port()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

impl Drop for OscReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(socket: UdpSocket, shared: Arc<Shared>) {
    let mut buf = [0u8; 4096];
    while shared.running.load(Ordering::SeqCst) {
        match socket.recv(&mut buf) {
            Ok(n) => match rosc::decoder::decode_udp(&buf[..n]) {
                Ok((_, packet)) => dispatch(&packet, &shared),
                Err(err) => warn!(?err, "failed to decode incoming OSC packet"),
            },
            Err(err) if matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(err) => {
                warn!(?err, "OSC receive error, stopping listener");
                break;
            }
        }
    }
}

fn dispatch(packet: &OscPacket, shared: &Arc<Shared>) {
    match packet {
        OscPacket::Bundle(bundle) => {
            for item in &bundle.content {
                dispatch(item, shared);
            }
        }
        OscPacket::Message(msg) => {
            let received = ReceivedMessage {
                address: msg.addr.clone(),
                args: msg.args.clone(),
            };

            if shared.learning.load(Ordering::SeqCst) {
                record_learned(shared, &received);
            }

            let handlers = shared.handlers.lock().expect("handler lock poisoned");
            for (address, handler) in handlers.iter() {
                if address == &received.address {
                    handler(&received);
                }
            }
            debug!(address = %received.address, "dispatched OSC message");
        }
    }
}

fn record_learned(shared: &Shared, received: &ReceivedMessage) {
    let mut learned = shared.learned.lock().expect("learned lock poisoned");
    if let Some(existing) = learned.iter_mut().find(|p| p.address == received.address) {
        existing.last_args = received.args.clone();
        existing.receive_count += 1;
    } else {
        learned.push(LearnedPattern {
            address: received.address.clone(),
            last_args: received.args.clone(),
            receive_count: 1,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::OscSender;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn dispatches_registered_handler() {
        let receiver = OscReceiver::bind(0).unwrap();
        let port = receiver.socket.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        receiver.register_handler("/cv/1", move |_msg| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        receiver.start().unwrap();

        let sender = OscSender::new_udp_unicast(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).unwrap();
        sender.send_float("/cv/1", 1.0).unwrap();

        std::thread::sleep(Duration::from_millis(300));
        receiver.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn learning_mode_records_patterns() {
        let receiver = OscReceiver::bind(0).unwrap();
        let port = receiver.socket.local_addr().unwrap().port();
        receiver.set_learning_mode(true);
        receiver.start().unwrap();

        let sender = OscSender::new_udp_unicast(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).unwrap();
        sender.send_float("/learned/1", 0.3).unwrap();

        std::thread::sleep(Duration::from_millis(300));
        receiver.stop();

        let patterns = receiver.drain_learned_patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].address, "/learned/1");
    }

    #[test]
    fn start_is_idempotent() {
        let receiver = OscReceiver::bind(0).unwrap();
        receiver.start().unwrap();
        receiver.start().unwrap();
        receiver.stop();
    }
}
