//! # Transport Loopback Tests
//!
//! Drive a real engine over localhost sockets:
//!
//! 1. **Round trip**: client and server roles in one engine, LZ4 on the wire,
//!    including a group that decompresses past the receive buffer
//! 2. **Handshake**: a raw socket negotiates XOR and exchanges encrypted packets
//! 3. **Faults**: handler errors, sends before negotiation, rejection, shutdown
//!
//! Run with: cargo test -p shardsync_net --test transport_loopback

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shardsync_net::{
    Cipher, CipherFactory, CipherInit, Connection, ConnectionId, ConnectionState, GroupMode, HandlerError,
    IncomingPacket, Lz4Compressor, OutgoingPacket, PacketReader, PacketSink, PacketTable, PacketWriter, Protocol,
    ReadResult, TransportConfig, TransportEngine, TransportError,
};

// ============================================================================
// FIXTURES
// ============================================================================

#[derive(Default)]
struct Session {
    received: Vec<String>,
    closed: Option<String>,
}

impl ConnectionState for Session {
    fn create(_id: ConnectionId, _peer: SocketAddr) -> Self {
        Self::default()
    }

    fn on_close(&mut self, reason: &str) {
        self.closed = Some(reason.to_owned());
    }
}

/// `0x10 len:u16 text`
struct Text(String);

impl OutgoingPacket for Text {
    fn id(&self) -> u8 {
        0x10
    }

    fn write_body(&self, writer: &mut PacketWriter<'_>) {
        let slot = writer.reserve_length();
        writer.write_bytes(self.0.as_bytes());
        writer.commit_length(slot);
    }
}

#[derive(Default)]
struct TextIn {
    text: String,
}

impl IncomingPacket<Session> for TextIn {
    fn read(&mut self, reader: &mut PacketReader<'_>) -> ReadResult {
        let (Some(_), Some(len)) = (reader.read_u8(), reader.read_u16()) else {
            return ReadResult::NeedMoreData;
        };
        let Some(body) = usize::from(len).checked_sub(3) else {
            return ReadResult::DiscardAll;
        };
        match reader.read_bytes(body) {
            Some(bytes) => {
                self.text = String::from_utf8_lossy(bytes).into_owned();
                ReadResult::Success
            }
            None => ReadResult::NeedMoreData,
        }
    }

    fn handle(&mut self, conn: &Connection<Session>, state: &mut Session) -> Result<(), HandlerError> {
        let text = std::mem::take(&mut self.text);
        if !text.starts_with("echo:") {
            conn.send_single_packet(&Text(format!("echo:{text}")));
        }
        state.received.push(text);
        Ok(())
    }

    fn reset(&mut self) {
        self.text.clear();
    }
}

/// `0x11`, always fails in its handler.
struct FailIn;

impl IncomingPacket<Session> for FailIn {
    fn read(&mut self, reader: &mut PacketReader<'_>) -> ReadResult {
        match reader.read_u8() {
            Some(_) => ReadResult::Success,
            None => ReadResult::NeedMoreData,
        }
    }

    fn handle(&mut self, _: &Connection<Session>, _: &mut Session) -> Result<(), HandlerError> {
        Err("deliberate handler failure".into())
    }
}

struct Fail;

impl OutgoingPacket for Fail {
    fn id(&self) -> u8 {
        0x11
    }

    fn write_body(&self, _: &mut PacketWriter<'_>) {}
}

fn text_in() -> Box<dyn IncomingPacket<Session>> {
    Box::new(TextIn::default())
}

fn fail_in() -> Box<dyn IncomingPacket<Session>> {
    Box::new(FailIn)
}

/// Handshake `0x01 key` enables XOR with `key`, `0x00` means plain.
struct XorCipher {
    key: u8,
}

impl Cipher for XorCipher {
    fn init(&mut self, input: &[u8]) -> CipherInit {
        match input {
            [] | [0x01] => CipherInit::NeedMoreData,
            [0x00, ..] => CipherInit::NoCipher { consumed: 1 },
            [0x01, key, ..] => {
                self.key = *key;
                CipherInit::UseCipher { consumed: 2 }
            }
            _ => CipherInit::Invalid,
        }
    }

    fn encrypt(&mut self, input: &[u8], output: &mut [u8]) -> usize {
        for (o, i) in output.iter_mut().zip(input) {
            *o = i ^ self.key;
        }
        input.len()
    }

    fn decrypt(&mut self, input: &[u8], output: &mut [u8]) -> usize {
        self.encrypt(input, output)
    }
}

struct XorFactory;

impl CipherFactory for XorFactory {
    fn create(&self) -> Box<dyn Cipher> {
        Box::new(XorCipher { key: 0 })
    }
}

fn config() -> TransportConfig {
    TransportConfig {
        sender_threads: 2,
        io_threads: 1,
        buffer_len: 4096,
        max_idle_buffers: 64,
        stop_poll_ms: 10,
        nodelay: true,
        max_frame_len: 64 * 1024,
    }
}

fn protocol() -> Arc<dyn Protocol<Session>> {
    Arc::new(PacketTable::new().with(0x10, text_in).with(0x11, fail_in))
}

fn localhost() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Cycles the engine until `done` holds or five seconds pass.
fn pump(engine: &mut TransportEngine<Session>, mut done: impl FnMut(&TransportEngine<Session>) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        engine.cycle();
        if done(engine) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn received(conn: &Connection<Session>) -> Vec<String> {
    conn.state().received.clone()
}

// ============================================================================
// ROUND TRIP
// ============================================================================

#[test]
fn test_round_trip_with_lz4() {
    let mut engine = TransportEngine::builder(protocol())
        .config(config())
        .compressor(Arc::new(Lz4Compressor))
        .build()
        .unwrap();
    let server = engine.listen(localhost()).unwrap();
    let client = engine.connect(server.local_addr()).unwrap();

    client.send_single_packet(&Text("hello".into()));

    let conn = Arc::clone(client.connection());
    assert!(pump(&mut engine, |_| received(&conn) == ["echo:hello"]));
    assert_eq!(engine.connection_count(), 2);
}

#[test]
fn test_multi_use_group_compresses_once() {
    let mut engine = TransportEngine::builder(protocol())
        .config(config())
        .compressor(Arc::new(Lz4Compressor))
        .build()
        .unwrap();
    let server = engine.listen(localhost()).unwrap();
    let client = engine.connect(server.local_addr()).unwrap();

    let group = engine.groups().acquire(GroupMode::MultiUse);
    group.add_packet(&Text("echo:a".into())).unwrap();
    group.add_packet(&Text("echo:b".into())).unwrap();
    client.send_packet_group(&group);
    client.send_packet_group(&group);

    let client_id = client.connection().id();
    assert!(pump(&mut engine, |e| {
        e.connection_ids()
            .into_iter()
            .filter(|id| *id != client_id)
            .filter_map(|id| e.connection(id))
            .any(|c| c.state().received.len() == 4)
    }));
    assert_eq!(group.compression_passes(), 1);
    assert_eq!(group.send_count(), 2);

    group.dispose();
    assert!(pump(&mut engine, |_| group.is_disposed()));
}

#[test]
fn test_group_larger_than_receive_buffer() {
    let small = TransportConfig {
        buffer_len: 256,
        ..config()
    };
    let mut engine = TransportEngine::builder(protocol())
        .config(small)
        .compressor(Arc::new(Lz4Compressor))
        .build()
        .unwrap();
    let server = engine.listen(localhost()).unwrap();
    let client = engine.connect(server.local_addr()).unwrap();

    let group = engine.groups().single_use();
    for i in 0..60 {
        group.add_packet(&Text(format!("echo:item-{i:02}"))).unwrap();
    }
    assert!(group.copy_uncompressed().unwrap().len() > 256);
    client.send_packet_group(&group);
    drop(group);

    let client_id = client.connection().id();
    assert!(pump(&mut engine, |e| {
        e.connection_ids()
            .into_iter()
            .filter(|id| *id != client_id)
            .filter_map(|id| e.connection(id))
            .any(|c| c.state().received.len() == 60)
    }));
    assert!(!client.connection().is_closed());
}

#[test]
fn test_empty_group_is_not_queued() {
    let mut engine = TransportEngine::builder(protocol()).config(config()).build().unwrap();
    let server = engine.listen(localhost()).unwrap();
    let client = engine.connect(server.local_addr()).unwrap();

    let group = engine.groups().multi_use();
    client.send_packet_group(&group);

    assert_eq!(engine.pending_sends(), 0);
    assert_eq!(group.send_count(), 0);
}

// ============================================================================
// HANDSHAKE
// ============================================================================

#[test]
fn test_raw_client_negotiates_xor() {
    let mut engine = TransportEngine::builder(protocol())
        .config(config())
        .cipher_factory(Arc::new(XorFactory))
        .build()
        .unwrap();
    let server = engine.listen(localhost()).unwrap();

    let key = 0x5a;
    let mut socket = TcpStream::connect(server.local_addr()).unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut frame = Vec::new();
    shardsync_net::write_packet(&Text("hi".into()), &mut frame).unwrap();
    let mut wire = vec![0x01, key];
    wire.extend(frame.iter().map(|b| b ^ key));
    socket.write_all(&wire).unwrap();

    assert!(pump(&mut engine, |e| {
        e.connection_ids()
            .into_iter()
            .filter_map(|id| e.connection(id))
            .any(|c| c.is_negotiated() && c.state().received == ["hi"])
    }));

    let mut expected = Vec::new();
    shardsync_net::write_packet(&Text("echo:hi".into()), &mut expected).unwrap();
    let mut reply = vec![0u8; expected.len()];
    socket.read_exact(&mut reply).unwrap();
    let decoded: Vec<u8> = reply.iter().map(|b| b ^ key).collect();
    assert_eq!(decoded, expected);
}

#[test]
fn test_send_before_handshake_closes_connection() {
    let mut engine = TransportEngine::builder(protocol())
        .config(config())
        .cipher_factory(Arc::new(XorFactory))
        .build()
        .unwrap();
    let server = engine.listen(localhost()).unwrap();
    let client = engine.connect(server.local_addr()).unwrap();
    let conn = Arc::clone(client.connection());

    assert!(!conn.is_negotiated());
    client.send_single_packet(&Text("too early".into()));

    assert!(pump(&mut engine, |_| conn.state().closed.is_some()));
    let reason = conn.close_reason().unwrap();
    assert!(reason.contains("encryption handshake"), "{reason}");
}

// ============================================================================
// FAULTS
// ============================================================================

#[test]
fn test_handler_error_does_not_stop_cycle() {
    let mut engine = TransportEngine::builder(protocol()).config(config()).build().unwrap();
    let server = engine.listen(localhost()).unwrap();
    let client = engine.connect(server.local_addr()).unwrap();

    client.send_single_packet(&Fail);
    client.send_single_packet(&Text("after".into()));

    let conn = Arc::clone(client.connection());
    let mut errors = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && received(&conn).is_empty() {
        errors += engine.cycle().handler_errors;
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(errors, 1);
    assert_eq!(received(&conn), ["echo:after"]);
    assert!(!conn.is_closed());
}

struct Picky;

impl ConnectionState for Picky {
    fn create(_id: ConnectionId, _peer: SocketAddr) -> Self {
        Picky
    }

    fn allow(&mut self, _conn: &Connection<Self>) -> bool {
        false
    }
}

#[test]
fn test_rejected_connection_is_not_registered() {
    let mut engine = TransportEngine::<Picky>::builder(Arc::new(PacketTable::new()))
        .config(config())
        .build()
        .unwrap();
    let server = engine.listen(localhost()).unwrap();

    let result = engine.connect(server.local_addr());
    assert!(matches!(result, Err(TransportError::Rejected(_))));
    assert_eq!(engine.connection_count(), 0);
}

#[test]
fn test_shutdown_closes_every_session() {
    let mut engine = TransportEngine::builder(protocol()).config(config()).build().unwrap();
    let server = engine.listen(localhost()).unwrap();
    let client = engine.connect(server.local_addr()).unwrap();
    let conn = Arc::clone(client.connection());

    engine.shutdown();

    assert!(conn.is_closed());
    assert!(conn.state().closed.is_some());
    assert_eq!(engine.connection_count(), 0);
    assert!(matches!(engine.listen(localhost()), Err(TransportError::ShutDown)));
}
