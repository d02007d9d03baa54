//! # Shard Server
//!
//! Demo shard for manual runs: every connection gets a walker, and clients
//! move it with `0x02 direction:u8 sequence:u8`. Everyone within range sees
//! everyone else walk.
//!
//! ## Usage
//!
//! ```bash
//! RUST_LOG=shardsync=debug shard_server --config shard.toml --port 2593 --duration 60
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use shardsync_net::{
    Connection, ConnectionId, ConnectionState, HandlerError, IncomingPacket, PacketReader, PacketSink, PacketTable,
    ReadResult, TransportEngine,
};
use shardsync_sync::packets::DeleteObject;
use shardsync_sync::world::MAX_UPDATE_RANGE;
use shardsync_sync::{
    CharFlags, CharSyncQueue, CharacterView, Direction, EntityId, Highlight, ItemView, MountView, MovementBits,
    Point4, Sightline, SkillValue, Stats, SyncWorld, Visibility, Vitals,
};
use shardsync::{ShardConfig, ShardRuntime, TickLoop};
use tracing_subscriber::EnvFilter;

/// Where new walkers appear.
const SPAWN: Point4 = Point4::new(1000, 1000, 0, 0);

/// Steps applied per walker per tick; extra requests wait for the next one.
const MAX_STEPS_PER_TICK: usize = 4;

// ============================================================================
// SESSION AND PACKETS
// ============================================================================

struct Session {
    id: ConnectionId,
    steps: Vec<Direction>,
}

impl ConnectionState for Session {
    fn create(id: ConnectionId, peer: SocketAddr) -> Self {
        tracing::info!(conn = %id, %peer, "session created");
        Self { id, steps: Vec::new() }
    }

    fn on_close(&mut self, reason: &str) {
        tracing::info!(conn = %self.id, reason, "session closed");
    }
}

/// `0x02 direction:u8 sequence:u8`
#[derive(Default)]
struct WalkRequest {
    direction: u8,
}

impl IncomingPacket<Session> for WalkRequest {
    fn read(&mut self, reader: &mut PacketReader<'_>) -> ReadResult {
        let (Some(_), Some(direction), Some(_sequence)) = (reader.read_u8(), reader.read_u8(), reader.read_u8())
        else {
            return ReadResult::NeedMoreData;
        };
        self.direction = direction;
        ReadResult::Success
    }

    fn handle(&mut self, _conn: &Connection<Session>, state: &mut Session) -> Result<(), HandlerError> {
        state.steps.push(Direction::from_bits(self.direction));
        Ok(())
    }
}

fn walk_request() -> Box<dyn IncomingPacket<Session>> {
    Box::new(WalkRequest::default())
}

// ============================================================================
// WORLD
// ============================================================================

struct Walker {
    id: EntityId,
    conn: Arc<Connection<Session>>,
    name: String,
    point: Point4,
    direction: Direction,
}

impl CharacterView for Walker {
    fn id(&self) -> EntityId {
        self.id
    }

    fn is_deleted(&self) -> bool {
        self.conn.is_closed()
    }

    fn point(&self) -> Point4 {
        self.point
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> u16 {
        0x190
    }

    fn color(&self) -> u16 {
        0x83ea
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn flags(&self) -> CharFlags {
        CharFlags::default()
    }

    fn mount(&self) -> Option<MountView> {
        None
    }

    fn vitals(&self) -> Vitals {
        Vitals {
            hits: 100,
            max_hits: 100,
            mana: 50,
            max_mana: 50,
            stamina: 80,
            max_stamina: 80,
        }
    }

    fn stats(&self) -> Stats {
        Stats::default()
    }

    fn skill(&self, _id: u16) -> Option<SkillValue> {
        None
    }
}

#[derive(Default)]
struct WalkerWorld {
    walkers: HashMap<EntityId, Walker>,
    scratch: Vec<EntityId>,
}

impl WalkerWorld {
    /// Adds walkers for new connections and drops closed ones.
    fn sync_connections(&mut self, engine: &TransportEngine<Session>, chars: &CharSyncQueue) {
        for conn_id in engine.connection_ids() {
            let id = EntityId(conn_id.0);
            if self.walkers.contains_key(&id) {
                continue;
            }
            let Some(conn) = engine.connection(conn_id) else {
                continue;
            };
            let walker = Walker {
                id,
                conn,
                name: format!("walker{}", conn_id.0),
                point: SPAWN,
                direction: Direction::South,
            };
            tracing::info!(entity = %id, "walker joined");
            chars.resend(&walker);
            self.walkers.insert(id, walker);
        }

        let gone: Vec<EntityId> = self.walkers.values().filter(|w| w.conn.is_closed()).map(|w| w.id).collect();
        for id in gone {
            let Some(walker) = self.walkers.remove(&id) else {
                continue;
            };
            let mut viewers = std::mem::take(&mut self.scratch);
            viewers.clear();
            self.players_in_range(walker.point, MAX_UPDATE_RANGE, &mut viewers);
            for viewer in &viewers {
                if let Some(sink) = self.session(*viewer) {
                    sink.send_single_packet(&DeleteObject::new(id));
                }
            }
            self.scratch = viewers;
            tracing::info!(entity = %id, "walker left");
        }
    }

    /// Applies queued walk requests.
    fn walk(&mut self, chars: &CharSyncQueue) {
        for walker in self.walkers.values_mut() {
            let steps: Vec<Direction> = {
                let mut session = walker.conn.state();
                let take = session.steps.len().min(MAX_STEPS_PER_TICK);
                session.steps.drain(..take).collect()
            };
            for direction in steps {
                if direction == walker.direction {
                    let movement = MovementBits::walking().with(MovementBits::REQUESTED_STEP);
                    if let Err(e) = chars.about_to_change_position(&*walker, movement) {
                        tracing::warn!(entity = %walker.id, error = %e, "step rejected");
                        continue;
                    }
                    walker.point = walker.point.step(direction);
                } else {
                    chars.about_to_change_direction(&*walker, true);
                    walker.direction = direction;
                }
            }
        }
    }
}

impl SyncWorld for WalkerWorld {
    fn character(&self, id: EntityId) -> Option<&dyn CharacterView> {
        self.walkers.get(&id).map(|w| w as &dyn CharacterView)
    }

    fn item(&self, _id: EntityId) -> Option<&dyn ItemView> {
        None
    }

    fn players_in_range(&self, at: Point4, range: u16, out: &mut Vec<EntityId>) {
        out.extend(self.walkers.values().filter(|w| w.point.in_range(&at, range)).map(|w| w.id));
    }

    fn things_in_range(&self, at: Point4, range: u16, out: &mut Vec<EntityId>) {
        self.players_in_range(at, range, out);
    }

    fn session(&self, player: EntityId) -> Option<&dyn PacketSink> {
        self.walkers
            .get(&player)
            .filter(|w| !w.conn.is_closed())
            .map(|w| w.conn.as_ref() as &dyn PacketSink)
    }

    fn can_see_for_update(&self, observer: EntityId, target: EntityId, sightline: Sightline) -> Visibility {
        let (Some(obs), Some(tgt)) = (self.walkers.get(&observer), self.walkers.get(&target)) else {
            return Visibility::Hidden;
        };
        let (from, to) = match sightline {
            Sightline::Current => (obs.point, tgt.point),
            Sightline::TargetAt(point) => (obs.point, point),
            Sightline::ObserverAt(point) => (point, tgt.point),
        };
        if from.in_range(&to, self.update_range(observer)) {
            Visibility::Visible
        } else {
            Visibility::Hidden
        }
    }

    fn highlight_for(&self, _target: EntityId, _viewer: EntityId) -> Highlight {
        Highlight::Innocent
    }

    fn container_viewers(&self, _container: EntityId, _out: &mut Vec<EntityId>) {}
}

// ============================================================================
// MAIN
// ============================================================================

struct Args {
    config: Option<String>,
    port: Option<u16>,
    duration_secs: Option<u64>,
}

fn parse_args() -> Option<Args> {
    let mut args = Args {
        config: None,
        port: None,
        duration_secs: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" | "-c" => args.config = it.next(),
            "--port" | "-p" => args.port = it.next().and_then(|v| v.parse().ok()),
            "--duration" | "-d" => args.duration_secs = it.next().and_then(|v| v.parse().ok()),
            "--help" | "-h" => {
                println!("Usage: shard_server [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>     TOML config (default: built-in defaults)");
                println!("  -p, --port <PORT>       Override the listen port");
                println!("  -d, --duration <SECS>   Run for N seconds then exit");
                println!("  -h, --help              Show this help");
                return None;
            }
            other => eprintln!("ignoring unknown argument {other}"),
        }
    }
    Some(args)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let Some(args) = parse_args() else {
        return;
    };

    if let Err(e) = run(&args) {
        tracing::error!(error = %e, "shard server failed");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), shardsync::RuntimeError> {
    let mut config = match &args.config {
        Some(path) => ShardConfig::from_file(path)?,
        None => ShardConfig::default(),
    };
    if let Some(port) = args.port {
        config.listen.set_port(port);
    }

    let protocol = Arc::new(PacketTable::<Session>::new().with(0x02, walk_request));
    let mut runtime = ShardRuntime::from_config(protocol, &config)?;
    let server = runtime.listen(config.listen)?;
    tracing::info!(addr = %server.local_addr(), tick_rate = config.tick_rate, "listening");

    let mut world = WalkerWorld::default();
    let mut ticks = TickLoop::new(config.tick_rate);
    let report_every = u64::from(config.tick_rate) * 10;
    let started = Instant::now();

    loop {
        if args.duration_secs.is_some_and(|d| started.elapsed().as_secs() >= d) {
            break;
        }
        ticks.wait_for_next_tick();

        while ticks.should_tick() {
            let start = ticks.begin_tick();
            world.sync_connections(runtime.engine(), runtime.chars());
            let report = runtime.tick(&mut world, |world, chars, _items| world.walk(chars));
            ticks.end_tick(start);

            match report {
                Ok(report) if report.cycle.handler_errors > 0 => {
                    tracing::warn!(errors = report.cycle.handler_errors, "handler errors this tick");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "flush aborted"),
            }

            if ticks.tick_count() % report_every == 0 {
                let stats = ticks.stats();
                tracing::info!(
                    tick = ticks.tick_count(),
                    uptime_s = started.elapsed().as_secs(),
                    walkers = world.walkers.len(),
                    connections = runtime.engine().connection_count(),
                    avg_tick_us = stats.avg_tick_us,
                    late_percent = stats.late_percent(),
                    "status"
                );
            }
        }
    }

    server.stop();
    runtime.shutdown();
    Ok(())
}
