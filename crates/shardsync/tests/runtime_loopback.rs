//! # Runtime Loopback Tests
//!
//! One shard runtime, real sockets:
//!
//! 1. **Flush to wire**: a resend reaches the client socket as raw bytes
//! 2. **Tick order**: dispatch runs before the update closure, flush after
//! 3. **Config**: invalid configs never start an engine
//!
//! Run with: cargo test -p shardsync --test runtime_loopback

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shardsync::{ConfigError, RuntimeError, ShardConfig, ShardRuntime};
use shardsync_net::{
    Connection, ConnectionId, ConnectionState, HandlerError, IncomingPacket, PacketReader, PacketSink, PacketTable,
    ReadResult,
};
use shardsync_sync::{
    CharFlags, CharacterView, Direction, EntityId, Highlight, ItemView, MountView, Point4, Sightline, SkillValue,
    Stats, SyncWorld, Visibility, Vitals,
};

// ============================================================================
// FIXTURES
// ============================================================================

#[derive(Default)]
struct Session {
    pings: usize,
}

impl ConnectionState for Session {
    fn create(_id: ConnectionId, _peer: SocketAddr) -> Self {
        Self::default()
    }
}

/// `0x73 seq:u8`
#[derive(Default)]
struct Ping;

impl IncomingPacket<Session> for Ping {
    fn read(&mut self, reader: &mut PacketReader<'_>) -> ReadResult {
        match (reader.read_u8(), reader.read_u8()) {
            (Some(_), Some(_)) => ReadResult::Success,
            _ => ReadResult::NeedMoreData,
        }
    }

    fn handle(&mut self, _conn: &Connection<Session>, state: &mut Session) -> Result<(), HandlerError> {
        state.pings += 1;
        Ok(())
    }
}

fn ping() -> Box<dyn IncomingPacket<Session>> {
    Box::new(Ping)
}

struct Player {
    id: EntityId,
    conn: Arc<Connection<Session>>,
    point: Point4,
}

impl CharacterView for Player {
    fn id(&self) -> EntityId {
        self.id
    }

    fn is_deleted(&self) -> bool {
        false
    }

    fn point(&self) -> Point4 {
        self.point
    }

    fn name(&self) -> &str {
        "Player"
    }

    fn model(&self) -> u16 {
        0x190
    }

    fn color(&self) -> u16 {
        0
    }

    fn direction(&self) -> Direction {
        Direction::South
    }

    fn flags(&self) -> CharFlags {
        CharFlags::default()
    }

    fn mount(&self) -> Option<MountView> {
        None
    }

    fn vitals(&self) -> Vitals {
        Vitals::default()
    }

    fn stats(&self) -> Stats {
        Stats::default()
    }

    fn skill(&self, _id: u16) -> Option<SkillValue> {
        None
    }
}

#[derive(Default)]
struct OnePlayerWorld {
    player: Option<Player>,
}

impl SyncWorld for OnePlayerWorld {
    fn character(&self, id: EntityId) -> Option<&dyn CharacterView> {
        self.player.as_ref().filter(|p| p.id == id).map(|p| p as &dyn CharacterView)
    }

    fn item(&self, _id: EntityId) -> Option<&dyn ItemView> {
        None
    }

    fn players_in_range(&self, at: Point4, range: u16, out: &mut Vec<EntityId>) {
        out.extend(self.player.iter().filter(|p| p.point.in_range(&at, range)).map(|p| p.id));
    }

    fn things_in_range(&self, at: Point4, range: u16, out: &mut Vec<EntityId>) {
        self.players_in_range(at, range, out);
    }

    fn session(&self, player: EntityId) -> Option<&dyn PacketSink> {
        self.player
            .as_ref()
            .filter(|p| p.id == player)
            .map(|p| p.conn.as_ref() as &dyn PacketSink)
    }

    fn can_see_for_update(&self, _observer: EntityId, _target: EntityId, _sightline: Sightline) -> Visibility {
        Visibility::Visible
    }

    fn highlight_for(&self, _target: EntityId, _viewer: EntityId) -> Highlight {
        Highlight::Innocent
    }

    fn container_viewers(&self, _container: EntityId, _out: &mut Vec<EntityId>) {}
}

fn uncompressed_config() -> ShardConfig {
    let mut config = ShardConfig::default();
    config.compression = false;
    config.listen = "127.0.0.1:0".parse().unwrap();
    config
}

/// Starts a runtime, connects one raw client and waits for the server side.
fn connected() -> (ShardRuntime<Session>, TcpStream, Arc<Connection<Session>>) {
    let config = uncompressed_config();
    let protocol = Arc::new(PacketTable::<Session>::new().with(0x73, ping));
    let mut runtime = ShardRuntime::from_config(protocol, &config).unwrap();
    let server = runtime.listen(config.listen).unwrap();

    let client = TcpStream::connect(server.local_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let ids = runtime.engine().connection_ids();
        if let Some(conn) = ids.first().and_then(|&id| runtime.engine().connection(id)) {
            return (runtime, client, conn);
        }
        assert!(Instant::now() < deadline, "server never saw the connection");
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ============================================================================
// FLUSH TO WIRE
// ============================================================================

#[test]
fn test_resend_reaches_the_socket() {
    let (mut runtime, mut client, conn) = connected();
    let mut world = OnePlayerWorld {
        player: Some(Player {
            id: EntityId(1),
            conn,
            point: Point4::new(100, 100, 0, 0),
        }),
    };

    let report = runtime
        .tick(&mut world, |world, chars, _| {
            if let Some(player) = &world.player {
                chars.resend(player);
            }
        })
        .unwrap();
    assert_eq!(report.chars.entities, 1);
    assert_eq!(report.chars.sends, 1);

    let mut first = [0u8; 1];
    client.read_exact(&mut first).unwrap();
    assert_eq!(first[0], 0x20);

    runtime.shutdown();
}

// ============================================================================
// TICK ORDER
// ============================================================================

#[test]
fn test_update_sees_dispatched_packets() {
    use std::io::Write;

    let (mut runtime, mut client, conn) = connected();
    client.write_all(&[0x73, 0x01, 0x73, 0x02]).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut world = OnePlayerWorld::default();
    let mut handled = 0;
    while handled < 2 {
        assert!(Instant::now() < deadline, "pings never arrived");
        let report = runtime
            .tick(&mut world, |_, _, _| {})
            .unwrap();
        handled += report.cycle.handled;
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(conn.state().pings, 2);
    assert!(runtime.tick_count() >= 1);
    runtime.shutdown();
}

// ============================================================================
// CONFIG
// ============================================================================

#[test]
fn test_invalid_config_does_not_start() {
    let mut config = uncompressed_config();
    config.tick_rate = 0;
    let protocol = Arc::new(PacketTable::<Session>::new());
    let err = ShardRuntime::from_config(protocol, &config).unwrap_err();
    assert!(matches!(err, RuntimeError::Config(ConfigError::Invalid { field: "tick_rate", .. })));
}
