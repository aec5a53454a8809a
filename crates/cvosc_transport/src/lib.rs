//! OSC transport: sending to and listening from Open Sound Control peers.
//!
//! The sender supports UDP unicast, UDP multicast, and TCP targets with a
//! swappable destination address. The receiver runs one listener thread per
//! bound port and dispatches decoded messages to registered address
//! handlers, optionally recording everything seen while "learning mode" is
//! enabled so a caller can build a message template from real traffic.

mod address;
mod error;
mod receiver;
mod sender;

pub use address::{parse_channel_address, sanitize};
pub use error::{TransportError, TransportResult};
pub use receiver::{LearnedPattern, OscReceiver, ReceivedMessage};
pub use rosc::OscType;
pub use sender::{osc_time_immediate, OscSender, TransportKind};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        assert!(sanitize("/cv/1").is_ok());
    }
}
