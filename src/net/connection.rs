//! Per-peer protocol state machine.
//!
//! A `Connection` owns a buffered socket and tracks which handshake field
//! it is currently reading, accumulating it in a per-field scratch buffer.
//! Fields are validated as they complete; replies are queued as outbound
//! buffers and drained by the write handler. The server decides how to
//! apply the connection's interest flags to the event loop.
//!
//! The read handler re-enters the state machine after every completed field
//! so that one readiness notification can advance through several fields
//! already buffered in the kernel, and returns to the event loop as soon as
//! a fill reports `incomplete`.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Instant;

use log::*;

use crate::buffer::Buffer;
use crate::protocol::{self, ErrorCode, MessageType};

use super::socket::{BufferedSocket, FillStatus, FlushStatus};

/// Which handshake field the connection is currently reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadState {
    ReadingMessageType,
    ReadingClientHelloMagicNumber,
    ReadingClientHelloProtocolVersion,
    ReadingServerHelloMagicNumber,
    ReadingServerHelloProtocolVersion,
    ReadingServerHelloServerId,
    ReadingServerHelloClusterNameLength,
    ReadingServerHelloClusterName,
    /// Absorbing: the connection is only being drained for close.
    Terminal,
}

pub struct Connection<S> {
    socket: BufferedSocket<S>,
    read_state: ReadState,
    interested_in_reads: bool,
    interested_in_writes: bool,
    close_after_flush: bool,
    closed: bool,
    handshake_complete: bool,
    created: Instant,

    /// Peer id announced in a SERVER_HELLO received on this connection.
    peer_server_id: Option<u32>,
    /// Set on outbound mesh links: the cluster node this link targets.
    outbound_peer_id: Option<u32>,

    // Scratch buffers for the field currently being read. The cluster-name
    // buffer is re-sized to the announced length when it becomes known.
    incoming_message_type: Buffer,
    incoming_magic_number: Buffer,
    incoming_protocol_version: Buffer,
    incoming_server_id: Buffer,
    incoming_cluster_name_length: Buffer,
    incoming_cluster_name: Buffer,

    /// Pending outbound replies, flushed in insertion order.
    outgoing: VecDeque<Buffer>,
}

impl<S: Read + Write> Connection<S> {
    /// Wrap an accepted stream. Starts out interested in reads only.
    pub fn new(stream: S) -> Connection<S> {
        Connection {
            socket: BufferedSocket::new(stream),
            read_state: ReadState::ReadingMessageType,
            interested_in_reads: true,
            interested_in_writes: false,
            close_after_flush: false,
            closed: false,
            handshake_complete: false,
            created: Instant::now(),
            peer_server_id: None,
            outbound_peer_id: None,
            incoming_message_type: Buffer::new(4),
            incoming_magic_number: Buffer::new(4),
            incoming_protocol_version: Buffer::new(4),
            incoming_server_id: Buffer::new(4),
            incoming_cluster_name_length: Buffer::new(2),
            incoming_cluster_name: Buffer::new(0),
            outgoing: VecDeque::new(),
        }
    }

    /// Wrap an outbound mesh link and queue the SERVER_HELLO announcing
    /// this node to the peer.
    pub fn new_outbound(
        stream: S,
        peer_id: u32,
        own_server_id: u32,
        cluster_name: &str,
    ) -> Connection<S> {
        let mut conn = Connection::new(stream);
        conn.outbound_peer_id = Some(peer_id);

        let name = cluster_name.as_bytes();
        let mut hello = Buffer::new(4 + 4 + 4 + 4 + 2 + name.len());
        hello.put_u32(MessageType::ServerHello as u32);
        hello.put_u32(protocol::MAGIC_NUMBER);
        hello.put_u32(protocol::PROTOCOL_VERSION);
        hello.put_u32(own_server_id);
        hello.put_u16(name.len() as u16);
        hello.put_bytes(name);
        hello.flip();

        conn.outgoing.push_back(hello);
        conn.interested_in_writes = true;
        conn
    }

    pub fn read_state(&self) -> ReadState {
        self.read_state
    }

    pub fn wants_read(&self) -> bool {
        self.interested_in_reads
    }

    pub fn wants_write(&self) -> bool {
        self.interested_in_writes
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn peer_server_id(&self) -> Option<u32> {
        self.peer_server_id
    }

    pub fn outbound_peer_id(&self) -> Option<u32> {
        self.outbound_peer_id
    }

    pub fn socket_mut(&mut self) -> &mut BufferedSocket<S> {
        &mut self.socket
    }

    /// Advance the handshake state machine as far as the buffered and
    /// kernel-queued bytes allow.
    ///
    /// Returns `Err` only for unexpected OS faults, which the dispatch loop
    /// treats as fatal. Peer closure and protocol violations are absorbed
    /// into the connection's own flags.
    pub fn on_readable(&mut self, cluster_name: &str) -> io::Result<()> {
        loop {
            match self.read_state {
                ReadState::ReadingMessageType => {
                    match self.socket.fill(&mut self.incoming_message_type)? {
                        FillStatus::Complete => {
                            self.incoming_message_type.flip();
                            let code = self.incoming_message_type.get_u32();
                            self.incoming_message_type.clear();
                            match MessageType::from_wire(code) {
                                Some(MessageType::ClientHello) => {
                                    self.read_state = ReadState::ReadingClientHelloMagicNumber;
                                }
                                Some(MessageType::ClientTest) => {
                                    self.queue_header_only_reply(MessageType::ClientTestReply);
                                }
                                Some(MessageType::ServerHello) => {
                                    self.read_state = ReadState::ReadingServerHelloMagicNumber;
                                }
                                Some(MessageType::ServerHelloReply) => {
                                    // The peer accepted our SERVER_HELLO;
                                    // the mesh link is established.
                                    debug!("outbound link confirmed by peer");
                                    self.handshake_complete = true;
                                }
                                _ => {
                                    debug!("unknown message type {:#010x}; closing", code);
                                    self.closed = true;
                                    return Ok(());
                                }
                            }
                        }
                        FillStatus::Incomplete => return Ok(()),
                        FillStatus::Closed => {
                            self.closed = true;
                            return Ok(());
                        }
                    }
                }

                ReadState::ReadingClientHelloMagicNumber => {
                    match self.socket.fill(&mut self.incoming_magic_number)? {
                        FillStatus::Complete => {
                            self.incoming_magic_number.flip();
                            let magic = self.incoming_magic_number.get_u32();
                            self.incoming_magic_number.clear();
                            if magic == protocol::MAGIC_NUMBER {
                                self.read_state = ReadState::ReadingClientHelloProtocolVersion;
                            } else {
                                self.stop_reading_and_send_error_reply(
                                    ErrorCode::InvalidMagicNumber,
                                    &protocol::invalid_magic_number_message(magic),
                                );
                                return Ok(());
                            }
                        }
                        FillStatus::Incomplete => return Ok(()),
                        FillStatus::Closed => {
                            self.closed = true;
                            return Ok(());
                        }
                    }
                }

                ReadState::ReadingClientHelloProtocolVersion => {
                    match self.socket.fill(&mut self.incoming_protocol_version)? {
                        FillStatus::Complete => {
                            self.incoming_protocol_version.flip();
                            let version = self.incoming_protocol_version.get_u32();
                            self.incoming_protocol_version.clear();
                            if version == protocol::PROTOCOL_VERSION {
                                self.read_state = ReadState::ReadingMessageType;
                                self.handshake_complete = true;
                                self.queue_header_only_reply(MessageType::ClientHelloReply);
                            } else {
                                self.stop_reading_and_send_error_reply(
                                    ErrorCode::UnsupportedProtocolVersion,
                                    &protocol::unsupported_protocol_version_message(version),
                                );
                                return Ok(());
                            }
                        }
                        FillStatus::Incomplete => return Ok(()),
                        FillStatus::Closed => {
                            self.closed = true;
                            return Ok(());
                        }
                    }
                }

                ReadState::ReadingServerHelloMagicNumber => {
                    match self.socket.fill(&mut self.incoming_magic_number)? {
                        FillStatus::Complete => {
                            self.incoming_magic_number.flip();
                            let magic = self.incoming_magic_number.get_u32();
                            self.incoming_magic_number.clear();
                            if magic == protocol::MAGIC_NUMBER {
                                self.read_state = ReadState::ReadingServerHelloProtocolVersion;
                            } else {
                                self.stop_reading_and_send_error_reply(
                                    ErrorCode::InvalidMagicNumber,
                                    &protocol::invalid_magic_number_message(magic),
                                );
                                return Ok(());
                            }
                        }
                        FillStatus::Incomplete => return Ok(()),
                        FillStatus::Closed => {
                            self.closed = true;
                            return Ok(());
                        }
                    }
                }

                ReadState::ReadingServerHelloProtocolVersion => {
                    match self.socket.fill(&mut self.incoming_protocol_version)? {
                        FillStatus::Complete => {
                            self.incoming_protocol_version.flip();
                            let version = self.incoming_protocol_version.get_u32();
                            self.incoming_protocol_version.clear();
                            if version == protocol::PROTOCOL_VERSION {
                                self.read_state = ReadState::ReadingServerHelloServerId;
                            } else {
                                self.stop_reading_and_send_error_reply(
                                    ErrorCode::UnsupportedProtocolVersion,
                                    &protocol::unsupported_protocol_version_message(version),
                                );
                                return Ok(());
                            }
                        }
                        FillStatus::Incomplete => return Ok(()),
                        FillStatus::Closed => {
                            self.closed = true;
                            return Ok(());
                        }
                    }
                }

                ReadState::ReadingServerHelloServerId => {
                    match self.socket.fill(&mut self.incoming_server_id)? {
                        FillStatus::Complete => {
                            self.incoming_server_id.flip();
                            self.peer_server_id = Some(self.incoming_server_id.get_u32());
                            self.incoming_server_id.clear();
                            self.read_state = ReadState::ReadingServerHelloClusterNameLength;
                        }
                        FillStatus::Incomplete => return Ok(()),
                        FillStatus::Closed => {
                            self.closed = true;
                            return Ok(());
                        }
                    }
                }

                ReadState::ReadingServerHelloClusterNameLength => {
                    match self.socket.fill(&mut self.incoming_cluster_name_length)? {
                        FillStatus::Complete => {
                            self.incoming_cluster_name_length.flip();
                            let length = self.incoming_cluster_name_length.get_u16();
                            self.incoming_cluster_name_length.clear();
                            self.incoming_cluster_name.reset_and_grow(length as usize);
                            self.read_state = ReadState::ReadingServerHelloClusterName;
                        }
                        FillStatus::Incomplete => return Ok(()),
                        FillStatus::Closed => {
                            self.closed = true;
                            return Ok(());
                        }
                    }
                }

                ReadState::ReadingServerHelloClusterName => {
                    match self.socket.fill(&mut self.incoming_cluster_name)? {
                        FillStatus::Complete => {
                            self.incoming_cluster_name.flip();
                            let limit = self.incoming_cluster_name.limit();
                            let name = self.incoming_cluster_name.get_bytes(limit);
                            self.incoming_cluster_name.clear();
                            if name == cluster_name.as_bytes() {
                                debug!(
                                    "peer server {:?} joined cluster handshake",
                                    self.peer_server_id
                                );
                                self.read_state = ReadState::ReadingMessageType;
                                self.handshake_complete = true;
                                self.queue_header_only_reply(MessageType::ServerHelloReply);
                            } else {
                                self.stop_reading_and_send_error_reply(
                                    ErrorCode::ClusterNameMismatch,
                                    &protocol::cluster_name_mismatch_message(),
                                );
                                return Ok(());
                            }
                        }
                        FillStatus::Incomplete => return Ok(()),
                        FillStatus::Closed => {
                            self.closed = true;
                            return Ok(());
                        }
                    }
                }

                ReadState::Terminal => return Ok(()),
            }
        }
    }

    /// Drain the outbound queue, then the socket's internal write buffer.
    pub fn on_writable(&mut self) -> io::Result<()> {
        while let Some(buffer) = self.outgoing.front_mut() {
            match self.socket.write(buffer)? {
                FlushStatus::Complete => {
                    self.outgoing.pop_front();
                }
                FlushStatus::Incomplete => return Ok(()),
                FlushStatus::Closed => {
                    self.closed = true;
                    return Ok(());
                }
            }
        }

        match self.socket.flush()? {
            FlushStatus::Complete => {
                if self.close_after_flush {
                    self.closed = true;
                } else {
                    self.interested_in_writes = false;
                }
                Ok(())
            }
            FlushStatus::Incomplete => Ok(()),
            FlushStatus::Closed => {
                self.closed = true;
                Ok(())
            }
        }
    }

    fn queue_header_only_reply(&mut self, message_type: MessageType) {
        let mut reply = Buffer::new(4);
        reply.put_u32(message_type as u32);
        reply.flip();
        self.outgoing.push_back(reply);
        self.interested_in_writes = true;
    }

    /// Validation failed: enter the terminal state, stop watching reads so
    /// unread bytes cannot keep re-notifying us (live-lock hazard), queue a
    /// structured error reply, and close once it has flushed.
    fn stop_reading_and_send_error_reply(&mut self, error_code: ErrorCode, error_message: &str) {
        warn!("handshake rejected ({:?}): {}", error_code, error_message);
        self.read_state = ReadState::Terminal;
        self.interested_in_reads = false;

        let message = error_message.as_bytes();
        let mut reply = Buffer::new(4 + 4 + 2 + message.len());
        reply.put_u32(MessageType::ErrorReply as u32);
        reply.put_u32(error_code as u32);
        reply.put_u16(message.len() as u16);
        reply.put_bytes(message);
        reply.flip();
        self.outgoing.push_back(reply);

        self.close_after_flush = true;
        self.interested_in_writes = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const CLUSTER: &str = "prod-west";

    /// Test stream: reads pop scripted chunks (empty chunk = EOF, empty
    /// script = EAGAIN); writes always succeed and are captured.
    struct FakeStream {
        reads: VecDeque<Vec<u8>>,
        written: Vec<u8>,
    }

    impl FakeStream {
        fn new() -> FakeStream {
            FakeStream {
                reads: VecDeque::new(),
                written: Vec::new(),
            }
        }
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                None => Err(io::Error::new(io::ErrorKind::WouldBlock, "eagain")),
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
            }
        }
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn client_hello(magic: u32, version: u32) -> Vec<u8> {
        let mut b = Buffer::new(12);
        b.put_u32(MessageType::ClientHello as u32);
        b.put_u32(magic);
        b.put_u32(version);
        b.flip();
        b.readable().to_vec()
    }

    fn server_hello(magic: u32, version: u32, server_id: u32, cluster: &str) -> Vec<u8> {
        let mut b = Buffer::new(4 + 4 + 4 + 4 + 2 + cluster.len());
        b.put_u32(MessageType::ServerHello as u32);
        b.put_u32(magic);
        b.put_u32(version);
        b.put_u32(server_id);
        b.put_u16(cluster.len() as u16);
        b.put_bytes(cluster.as_bytes());
        b.flip();
        b.readable().to_vec()
    }

    fn drain_writes(conn: &mut Connection<FakeStream>) -> Vec<u8> {
        conn.on_writable().unwrap();
        std::mem::take(&mut conn.socket_mut().stream_mut().written)
    }

    #[test]
    fn client_hello_accepted() {
        let mut conn = Connection::new(FakeStream::new());
        conn.socket_mut()
            .stream_mut()
            .reads
            .push_back(client_hello(protocol::MAGIC_NUMBER, protocol::PROTOCOL_VERSION));

        conn.on_readable(CLUSTER).unwrap();

        assert!(conn.handshake_complete());
        assert_eq!(conn.read_state(), ReadState::ReadingMessageType);
        assert!(conn.wants_write());
        assert!(!conn.is_closed());

        let written = drain_writes(&mut conn);
        assert_eq!(written, (MessageType::ClientHelloReply as u32).to_be_bytes());
        // Reply queue drained: back to reads only, still open.
        assert!(!conn.wants_write());
        assert!(!conn.is_closed());
    }

    #[test]
    fn client_hello_accepted_byte_by_byte() {
        // The same handshake delivered one byte per readiness notification
        // must land in the same state.
        let mut conn = Connection::new(FakeStream::new());
        let bytes = client_hello(protocol::MAGIC_NUMBER, protocol::PROTOCOL_VERSION);

        for byte in bytes {
            conn.socket_mut().stream_mut().reads.push_back(vec![byte]);
            conn.on_readable(CLUSTER).unwrap();
        }

        assert!(conn.handshake_complete());
        assert_eq!(conn.read_state(), ReadState::ReadingMessageType);
        let written = drain_writes(&mut conn);
        assert_eq!(written, (MessageType::ClientHelloReply as u32).to_be_bytes());
    }

    #[test]
    fn client_hello_bad_magic_rejected() {
        let mut conn = Connection::new(FakeStream::new());
        conn.socket_mut()
            .stream_mut()
            .reads
            .push_back(client_hello(0xBAD0_BAD0, protocol::PROTOCOL_VERSION));

        conn.on_readable(CLUSTER).unwrap();

        assert_eq!(conn.read_state(), ReadState::Terminal);
        // Live-lock avoidance: no read interest while the error drains.
        assert!(!conn.wants_read());
        assert!(conn.wants_write());
        assert!(!conn.handshake_complete());

        let written = drain_writes(&mut conn);
        let mut reply = Buffer::new(written.len());
        reply.put_bytes(&written);
        reply.flip();
        assert_eq!(reply.get_u32(), MessageType::ErrorReply as u32);
        assert_eq!(reply.get_u32(), ErrorCode::InvalidMagicNumber as u32);
        let len = reply.get_u16() as usize;
        assert_eq!(reply.remaining(), len);

        // Closed once the reply has fully flushed.
        assert!(conn.is_closed());
    }

    #[test]
    fn client_hello_unsupported_version_rejected() {
        let mut conn = Connection::new(FakeStream::new());
        conn.socket_mut()
            .stream_mut()
            .reads
            .push_back(client_hello(protocol::MAGIC_NUMBER, 99));

        conn.on_readable(CLUSTER).unwrap();
        assert_eq!(conn.read_state(), ReadState::Terminal);

        let written = drain_writes(&mut conn);
        let mut reply = Buffer::new(written.len());
        reply.put_bytes(&written);
        reply.flip();
        assert_eq!(reply.get_u32(), MessageType::ErrorReply as u32);
        assert_eq!(
            reply.get_u32(),
            ErrorCode::UnsupportedProtocolVersion as u32
        );
    }

    #[test]
    fn server_hello_accepted() {
        let mut conn = Connection::new(FakeStream::new());
        conn.socket_mut().stream_mut().reads.push_back(server_hello(
            protocol::MAGIC_NUMBER,
            protocol::PROTOCOL_VERSION,
            7,
            CLUSTER,
        ));

        conn.on_readable(CLUSTER).unwrap();

        assert!(conn.handshake_complete());
        assert_eq!(conn.peer_server_id(), Some(7));
        assert_eq!(conn.read_state(), ReadState::ReadingMessageType);

        let written = drain_writes(&mut conn);
        assert_eq!(written, (MessageType::ServerHelloReply as u32).to_be_bytes());
    }

    #[test]
    fn server_hello_cluster_name_mismatch_rejected() {
        let mut conn = Connection::new(FakeStream::new());
        conn.socket_mut().stream_mut().reads.push_back(server_hello(
            protocol::MAGIC_NUMBER,
            protocol::PROTOCOL_VERSION,
            7,
            "some-other-cluster",
        ));

        conn.on_readable(CLUSTER).unwrap();

        assert!(!conn.handshake_complete());
        assert_eq!(conn.read_state(), ReadState::Terminal);
        assert!(!conn.wants_read());

        let written = drain_writes(&mut conn);
        let mut reply = Buffer::new(written.len());
        reply.put_bytes(&written);
        reply.flip();
        assert_eq!(reply.get_u32(), MessageType::ErrorReply as u32);
        assert_eq!(reply.get_u32(), ErrorCode::ClusterNameMismatch as u32);
        assert!(conn.is_closed());
    }

    #[test]
    fn client_test_probes_get_replies_and_state_is_preserved() {
        let mut conn = Connection::new(FakeStream::new());
        let probe = (MessageType::ClientTest as u32).to_be_bytes();
        conn.socket_mut().stream_mut().reads.push_back(probe.to_vec());
        conn.socket_mut().stream_mut().reads.push_back(probe.to_vec());

        conn.on_readable(CLUSTER).unwrap();

        assert_eq!(conn.read_state(), ReadState::ReadingMessageType);
        let written = drain_writes(&mut conn);
        let reply = (MessageType::ClientTestReply as u32).to_be_bytes();
        assert_eq!(written.len(), 8);
        assert_eq!(&written[..4], reply);
        assert_eq!(&written[4..], reply);
    }

    #[test]
    fn unknown_message_type_closes_silently() {
        let mut conn = Connection::new(FakeStream::new());
        conn.socket_mut()
            .stream_mut()
            .reads
            .push_back(0xDEAD_BEEFu32.to_be_bytes().to_vec());

        conn.on_readable(CLUSTER).unwrap();

        assert!(conn.is_closed());
        assert!(conn.socket_mut().stream_mut().written.is_empty());
    }

    #[test]
    fn peer_close_mid_field_tears_down() {
        let mut conn = Connection::new(FakeStream::new());
        // Two bytes of a message type, then EOF.
        conn.socket_mut().stream_mut().reads.push_back(vec![0x40, 0x00]);
        conn.socket_mut().stream_mut().reads.push_back(vec![]);

        conn.on_readable(CLUSTER).unwrap();
        assert!(conn.is_closed());
    }

    #[test]
    fn terminal_state_absorbs_further_data() {
        let mut conn = Connection::new(FakeStream::new());
        conn.socket_mut()
            .stream_mut()
            .reads
            .push_back(client_hello(0xBAD0_BAD0, protocol::PROTOCOL_VERSION));
        conn.on_readable(CLUSTER).unwrap();
        assert_eq!(conn.read_state(), ReadState::Terminal);

        // The peer keeps talking; the state machine must not consume it or
        // regain read interest.
        conn.socket_mut()
            .stream_mut()
            .reads
            .push_back(client_hello(protocol::MAGIC_NUMBER, protocol::PROTOCOL_VERSION));
        conn.on_readable(CLUSTER).unwrap();
        assert_eq!(conn.read_state(), ReadState::Terminal);
        assert!(!conn.wants_read());
    }

    #[test]
    fn outbound_link_queues_server_hello_and_accepts_reply() {
        let mut conn = Connection::new_outbound(FakeStream::new(), 1, 2, CLUSTER);
        assert_eq!(conn.outbound_peer_id(), Some(1));
        assert!(conn.wants_write());

        let written = drain_writes(&mut conn);
        let mut hello = Buffer::new(written.len());
        hello.put_bytes(&written);
        hello.flip();
        assert_eq!(hello.get_u32(), MessageType::ServerHello as u32);
        assert_eq!(hello.get_u32(), protocol::MAGIC_NUMBER);
        assert_eq!(hello.get_u32(), protocol::PROTOCOL_VERSION);
        assert_eq!(hello.get_u32(), 2);
        let len = hello.get_u16() as usize;
        assert_eq!(hello.get_bytes(len), CLUSTER.as_bytes());

        conn.socket_mut()
            .stream_mut()
            .reads
            .push_back((MessageType::ServerHelloReply as u32).to_be_bytes().to_vec());
        conn.on_readable(CLUSTER).unwrap();
        assert!(conn.handshake_complete());
        assert!(!conn.is_closed());
    }
}
