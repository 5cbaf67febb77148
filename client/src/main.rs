mod network;

use clap::Parser;
use log::{info, warn};
use rand::Rng;
use serde_json::json;
use std::time::Duration;

use network::{ClientEvent, RemoteClient};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Display name to join with
    #[arg(short, long, default_value = "wanderer")]
    name: String,

    /// Milliseconds between automatic move commands (0 disables them)
    #[arg(short, long, default_value = "1000")]
    move_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Connecting to {} as {}", args.server, args.name);
    let mut client = RemoteClient::connect(&args.server, &args.name).await?;

    let mut move_timer = tokio::time::interval(Duration::from_millis(args.move_interval.max(1)));

    loop {
        tokio::select! {
            event = client.recv() => {
                match event {
                    Some(ClientEvent::StateChanged { tick, state }) => {
                        info!("state at tick {tick}: {state}");
                    }
                    Some(ClientEvent::Event(payload)) => {
                        info!("event: {payload}");
                    }
                    Some(ClientEvent::Disconnected(reason)) => {
                        warn!("disconnected: {reason}");
                        break;
                    }
                    None => break,
                }
            }
            _ = move_timer.tick(), if args.move_interval > 0 => {
                let (dx, dy) = {
                    let mut rng = rand::thread_rng();
                    (rng.gen_range(-1..=1), rng.gen_range(-1..=1))
                };
                client.send_command(json!({"type": "move", "dx": dx, "dy": dy}));
            }
        }
    }

    Ok(())
}
