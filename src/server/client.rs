//! Per-connection protocol state and socket buffering

use crate::error::{Error, Result};
use crate::protocol::MessageId;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};

/// Cap on buffered unparsed request bytes. No legal request comes close,
/// so crossing it means a confused or hostile peer.
const RECV_BUFFER_CAP: usize = 1024;

/// Position in the protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProtocolState {
    /// TCP established, handshake not yet done
    Start,
    Connected,
    Active,
    Streaming,
}

pub(crate) struct ClientState {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub state: ProtocolState,
    /// Negotiated protocol version; 0 until CONNECT completes
    pub version: u32,
    recv_buffer: Vec<u8>,
}

impl ClientState {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ProtocolState::Start,
            version: 0,
            recv_buffer: Vec::new(),
        }
    }

    /// Drain the nonblocking socket into the receive buffer. Returns
    /// `Ok(false)` when the peer has closed its end. Must be called until
    /// it would block: readiness is edge-triggered.
    pub fn fill(&mut self) -> Result<bool> {
        let mut chunk = [0u8; 512];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(count) => {
                    self.recv_buffer.extend_from_slice(&chunk[..count]);
                    if self.recv_buffer.len() > RECV_BUFFER_CAP {
                        return Err(Error::Protocol(format!(
                            "receive buffer exceeded {RECV_BUFFER_CAP} bytes"
                        )));
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Pop one complete request off the receive buffer, if one is fully
    /// buffered.
    pub fn next_message(&mut self) -> Result<Option<(MessageId, Vec<u8>)>> {
        parse_message(&mut self.recv_buffer)
    }

    /// Write a whole message now. A full socket buffer is a hard failure;
    /// this server never queues partial writes for later.
    pub fn send(&mut self, message: &[u8]) -> Result<()> {
        self.stream.write_all(message)?;
        Ok(())
    }

    pub fn supports(&self, min_version: u32) -> bool {
        self.version >= min_version
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, ProtocolState::Active | ProtocolState::Streaming)
    }

    pub fn is_streaming(&self) -> bool {
        self.state == ProtocolState::Streaming
    }
}

/// Frame one request: a u16 id, then the fixed-size body that id implies.
/// `Ok(None)` means the buffer holds only part of a request so far.
fn parse_message(buffer: &mut Vec<u8>) -> Result<Option<(MessageId, Vec<u8>)>> {
    if buffer.len() < 2 {
        return Ok(None);
    }
    let raw = u16::from_le_bytes([buffer[0], buffer[1]]);
    let id = MessageId::try_from(raw)?;
    let Some(body_len) = id.request_body_len() else {
        return Err(Error::Protocol(format!(
            "{id:?} is a server-to-client message"
        )));
    };
    if buffer.len() < 2 + body_len {
        return Ok(None);
    }
    let body = buffer[2..2 + body_len].to_vec();
    buffer.drain(..2 + body_len);
    Ok(Some((id, body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages;

    #[test]
    fn test_partial_request_waits_for_more() {
        let mut buffer = vec![0u8];
        assert!(parse_message(&mut buffer).unwrap().is_none());

        // Full id, half the CONNECT body
        buffer = vec![0, 0, 6, 0];
        assert!(parse_message(&mut buffer).unwrap().is_none());
        assert_eq!(buffer.len(), 4, "incomplete request stays buffered");
    }

    #[test]
    fn test_queued_requests_parse_in_order() {
        let mut buffer = messages::connect_request(6);
        buffer.extend_from_slice(&messages::request(MessageId::ActivateRequest));
        buffer.extend_from_slice(&messages::haptic_tick_request(1, 20));

        let (id, body) = parse_message(&mut buffer).unwrap().unwrap();
        assert_eq!(id, MessageId::ConnectRequest);
        assert_eq!(body, 6u32.to_le_bytes());

        let (id, body) = parse_message(&mut buffer).unwrap().unwrap();
        assert_eq!(id, MessageId::ActivateRequest);
        assert!(body.is_empty());

        let (id, body) = parse_message(&mut buffer).unwrap().unwrap();
        assert_eq!(id, MessageId::HapticTickRequest);
        assert_eq!(body, [1, 0, 20, 0]);

        assert!(parse_message(&mut buffer).unwrap().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_unknown_id_is_an_error() {
        let mut buffer = vec![0xfe, 0xff];
        assert!(matches!(
            parse_message(&mut buffer),
            Err(Error::UnknownMessage(0xfffe))
        ));
    }

    #[test]
    fn test_server_to_client_id_is_an_error() {
        let mut buffer = messages::stop_stream_reply();
        assert!(matches!(
            parse_message(&mut buffer),
            Err(Error::Protocol(_))
        ));
    }
}
