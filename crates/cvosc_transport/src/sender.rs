//! OSC message sender: UDP unicast, UDP multicast, and TCP targets.

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::sync::RwLock;
use std::time::Duration;

use rosc::{OscBundle, OscMessage, OscPacket, OscTime, OscType};
use tracing::{debug, warn};

use crate::address::sanitize;
use crate::error::{TransportError, TransportResult};

/// Wire transport used to reach an OSC target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    UdpUnicast,
    UdpMulticast,
    Tcp,
}

enum Socket {
    Udp(UdpSocket),
    Tcp(RwLock<TcpStream>),
}

/// An IMMEDIATE OSC time tag: `{seconds: 0, fractional: 1}`, meaning
/// "execute as soon as received" rather than scheduling in the future.
pub fn osc_time_immediate() -> OscTime {
    OscTime {
        seconds: 0,
        fractional: 1,
    }
}

/// Sends OSC messages to a single configurable target.
pub struct OscSender {
    socket: Socket,
    target: RwLock<SocketAddr>,
    kind: TransportKind,
}

impl OscSender {
    pub fn new_udp_unicast(target: SocketAddr) -> TransportResult<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(|source| TransportError::BindError {
            addr: "0.0.0.0:0".to_string(),
            source,
        })?;
        Ok(Self {
            socket: Socket::Udp(socket),
            target: RwLock::new(target),
            kind: TransportKind::UdpUnicast,
        })
    }

    pub fn new_udp_multicast(group: Ipv4Addr, port: u16) -> TransportResult<Self> {
        let socket =
            UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(|source| TransportError::BindError {
                addr: "0.0.0.0:0".to_string(),
                source,
            })?;
        socket.set_multicast_ttl_v4(4)?;
        Ok(Self {
            socket: Socket::Udp(socket),
            target: RwLock::new(SocketAddr::from((group, port))),
            kind: TransportKind::UdpMulticast,
        })
    }

    pub fn new_tcp(target: SocketAddr) -> TransportResult<Self> {
        let stream =
            TcpStream::connect_timeout(&target, Duration::from_secs(5)).map_err(|source| {
                TransportError::BindError {
                    addr: target.to_string(),
                    source,
                }
            })?;
        stream.set_nodelay(true).ok();
        Ok(Self {
            socket: Socket::Tcp(RwLock::new(stream)),
            target: RwLock::new(target),
            kind: TransportKind::Tcp,
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Atomically swap the send target, e.g. when the user repoints a
    /// channel at a different host without tearing down the socket.
    pub fn set_target(&self, target: SocketAddr) {
        let mut guard = self.target.write().expect("target lock poisoned");
        *guard = target;
    }

    fn current_target(&self) -> SocketAddr {
        *self.target.read().expect("target lock poisoned")
    }

    fn send_packet(&self, packet: &OscPacket) -> TransportResult<()> {
        let bytes = rosc::encoder::encode(packet).map_err(|e| TransportError::Encode(format!("{e:?}")))?;
        match &self.socket {
            Socket::Udp(socket) => {
                socket.send_to(&bytes, self.current_target())?;
            }
            Socket::Tcp(stream) => {
                let mut guard = stream.write().expect("tcp stream lock poisoned");
                guard.write_all(&bytes)?;
            }
        }
        Ok(())
    }

    fn message(address: &str, args: Vec<OscType>) -> TransportResult<OscMessage> {
        sanitize(address)?;
        Ok(OscMessage {
            addr: address.to_string(),
            args,
        })
    }

    pub fn send_float(&self, address: &str, value: f32) -> TransportResult<()> {
        let msg = Self::message(address, vec![OscType::Float(value)])?;
        self.send_packet(&OscPacket::Message(msg))
    }

    pub fn send_int(&self, address: &str, value: i32) -> TransportResult<()> {
        let msg = Self::message(address, vec![OscType::Int(value)])?;
        self.send_packet(&OscPacket::Message(msg))
    }

    pub fn send_string(&self, address: &str, value: &str) -> TransportResult<()> {
        let msg = Self::message(address, vec![OscType::String(value.to_string())])?;
        self.send_packet(&OscPacket::Message(msg))
    }

    pub fn send_blob(&self, address: &str, value: Vec<u8>) -> TransportResult<()> {
        let msg = Self::message(address, vec![OscType::Blob(value)])?;
        self.send_packet(&OscPacket::Message(msg))
    }

    pub fn send_float_array(&self, address: &str, values: &[f32]) -> TransportResult<()> {
        let args = values.iter().copied().map(OscType::Float).collect();
        let msg = Self::message(address, args)?;
        self.send_packet(&OscPacket::Message(msg))
    }

    /// Send one float per channel address, bundled together with an
    /// IMMEDIATE time tag so they arrive as a single atomic unit.
    pub fn send_float_batch(&self, addresses: &[String], values: &[f32]) -> TransportResult<()> {
        if addresses.len() != values.len() {
            return Err(TransportError::SizeMismatch {
                expected: addresses.len(),
                got: values.len(),
            });
        }

        let mut content = Vec::with_capacity(addresses.len());
        for (addr, value) in addresses.iter().zip(values.iter()) {
            let msg = Self::message(addr, vec![OscType::Float(*value)])?;
            content.push(OscPacket::Message(msg));
        }

        let bundle = OscBundle {
            timetag: osc_time_immediate(),
            content,
        };
        debug!(count = addresses.len(), "sending OSC batch");
        self.send_packet(&OscPacket::Bundle(bundle))
    }
}

impl Drop for OscSender {
    fn drop(&mut self) {
        if let Socket::Tcp(_) = &self.socket {
            warn!(kind = ?self.kind, "closing OSC sender");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    #[test]
    fn send_float_to_bound_loopback_socket() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();
        let sender = OscSender::new_udp_unicast(loopback(port)).unwrap();

        sender.send_float("/cv/1", 0.5).unwrap();

        let mut buf = [0u8; 1024];
        receiver.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        let (_, packet) = rosc::decoder::decode_udp(&buf[..n]).unwrap();
        match packet {
            OscPacket::Message(msg) => {
                assert_eq!(msg.addr, "/cv/1");
                assert_eq!(msg.args, vec![OscType::Float(0.5)]);
            }
            _ => panic!("expected a message"),
        }
    }

    #[test]
    fn batch_rejects_length_mismatch() {
        let sender = OscSender::new_udp_unicast(loopback(9999)).unwrap();
        let result = sender.send_float_batch(&["/cv/1".to_string()], &[1.0, 2.0]);
        assert!(matches!(result, Err(TransportError::SizeMismatch { .. })));
    }

    #[test]
    fn set_target_swaps_destination() {
        let sender = OscSender::new_udp_unicast(loopback(1)).unwrap();
        sender.set_target(loopback(2));
        assert_eq!(sender.current_target().port(), 2);
    }

    #[test]
    fn rejects_malformed_address() {
        let sender = OscSender::new_udp_unicast(loopback(1)).unwrap();
        let result = sender.send_float("not-an-address", 1.0);
        assert!(result.is_err());
    }
}
