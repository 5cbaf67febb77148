use clap::Parser;
use log::{debug, info};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

use server::local::{LocalClient, LocalEvent};
use server::net::Gateway;
use server::projection::ProjectionTable;
use server::session::{
    Application, ClientInfo, Events, Session, SessionConfig, SessionHandle,
};

/// Authoritative arena server: joined players move on a bounded grid.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind both transport legs on
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Tick interval in milliseconds
    #[arg(short, long, default_value = "500")]
    tick_ms: u64,

    /// Number of in-process bot clients
    #[arg(short, long, default_value = "0")]
    bots: usize,
}

const ARENA_EXTENT: i64 = 20;

const COLORS: [&str; 8] = [
    "blue", "red", "green", "purple", "orange", "cyan", "magenta", "yellow",
];

#[derive(Debug, Serialize)]
struct ArenaState {
    clock: u64,
    players: BTreeMap<String, ArenaPlayer>,
}

#[derive(Debug, Serialize)]
struct ArenaPlayer {
    x: i64,
    y: i64,
    color: String,
    moves: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ArenaCommand {
    Move { dx: i64, dy: i64 },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ArenaEvent {
    Welcome { name: String, extent: i64 },
    Joined { name: String },
    Left { name: String },
}

struct ArenaApp;

impl Application for ArenaApp {
    type State = ArenaState;
    type Command = ArenaCommand;
    type Event = ArenaEvent;

    fn projection_for(&self, client: &ClientInfo) -> ProjectionTable {
        // Everyone sees the arena; move counters are private to their owner.
        ProjectionTable::include_all()
            .exclude(["players", "*", "moves"])
            .include(["players", client.name.as_str(), "moves"])
    }

    fn simulate(
        &mut self,
        state: &mut ArenaState,
        _events: &mut Events<ArenaEvent>,
        _elapsed: Duration,
    ) {
        state.clock += 1;
    }

    fn client_joined(
        &mut self,
        state: &mut ArenaState,
        events: &mut Events<ArenaEvent>,
        client: &ClientInfo,
    ) {
        let mut rng = rand::thread_rng();
        let player = ArenaPlayer {
            x: rng.gen_range(-ARENA_EXTENT..=ARENA_EXTENT),
            y: rng.gen_range(-ARENA_EXTENT..=ARENA_EXTENT),
            color: COLORS[state.players.len() % COLORS.len()].to_string(),
            moves: 0,
        };
        info!("spawned {} at ({}, {})", client.name, player.x, player.y);
        state.players.insert(client.name.clone(), player);

        events.send_to(
            client.id.clone(),
            ArenaEvent::Welcome {
                name: client.name.clone(),
                extent: ARENA_EXTENT,
            },
        );
        events.broadcast(ArenaEvent::Joined {
            name: client.name.clone(),
        });
    }

    fn client_quit(
        &mut self,
        state: &mut ArenaState,
        events: &mut Events<ArenaEvent>,
        client: &ClientInfo,
    ) {
        state.players.remove(&client.name);
        events.broadcast(ArenaEvent::Left {
            name: client.name.clone(),
        });
    }

    fn command(
        &mut self,
        state: &mut ArenaState,
        _events: &mut Events<ArenaEvent>,
        client: &ClientInfo,
        command: ArenaCommand,
    ) {
        let ArenaCommand::Move { dx, dy } = command;
        if let Some(player) = state.players.get_mut(&client.name) {
            player.x = (player.x + dx.clamp(-1, 1)).clamp(-ARENA_EXTENT, ARENA_EXTENT);
            player.y = (player.y + dy.clamp(-1, 1)).clamp(-ARENA_EXTENT, ARENA_EXTENT);
            player.moves += 1;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let initial = ArenaState {
        clock: 0,
        players: BTreeMap::new(),
    };
    let config = SessionConfig::fixed(Duration::from_millis(args.tick_ms));
    let (session, handle) = Session::new(ArenaApp, initial, config);

    let address = format!("{}:{}", args.host, args.port);
    let gateway = Gateway::bind(&address, handle.clone()).await?;

    for bot in 0..args.bots {
        spawn_bot(handle.clone(), bot);
    }

    let session_task = tokio::spawn(session.run());
    let gateway_task = tokio::spawn(gateway.run());

    tokio::select! {
        result = session_task => {
            if let Err(e) = result {
                eprintln!("Session task panicked: {e}");
            }
        }
        result = gateway_task => {
            match result {
                Ok(Err(e)) => eprintln!("Gateway failed: {e}"),
                Err(e) => eprintln!("Gateway task panicked: {e}"),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, stopping session");
            handle.stop();
        }
    }

    Ok(())
}

/// An in-process client that wanders the arena, driving real protocol
/// traffic through the embedded transport.
fn spawn_bot(handle: SessionHandle, index: usize) {
    tokio::spawn(async move {
        let name = format!("bot-{index}");
        let mut client = LocalClient::connect(&handle, format!("embedded-{index}"), name.clone());

        let mut move_timer =
            tokio::time::interval(Duration::from_millis(700 + 137 * index as u64));

        loop {
            tokio::select! {
                event = client.recv() => {
                    match event {
                        Some(LocalEvent::StateChanged { tick }) => {
                            debug!("{name} mirrored state at tick {tick}");
                        }
                        Some(LocalEvent::Event(payload)) => {
                            debug!("{name} saw event {payload}");
                        }
                        Some(LocalEvent::Disconnected(reason)) => {
                            info!("{name} disconnected: {reason}");
                            break;
                        }
                        None => break,
                    }
                }
                _ = move_timer.tick() => {
                    let (dx, dy) = {
                        let mut rng = rand::thread_rng();
                        (rng.gen_range(-1..=1), rng.gen_range(-1..=1))
                    };
                    client.send_command(json!({"type": "move", "dx": dx, "dy": dy}));
                }
            }
        }
    });
}
