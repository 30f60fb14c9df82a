use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::cell::RefCell;
use std::net::TcpStream;
use std::path::PathBuf;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use waypoint::{CoordinatorClient, CoordinatorConfig, GameInfo, JoinError, ServerGameType};

const TICK: Duration = Duration::from_millis(30);

#[derive(Parser, Debug)]
#[command(name = "waypoint")]
#[command(about = "Game Coordinator client: register a server, list servers, join by join key")]
#[command(version)]
struct Cli {
    /// TOML config file; defaults apply for anything missing
    #[arg(short, long, env = "WAYPOINT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a server and keep it listed until interrupted
    Register {
        /// Port our game server accepts players on
        #[arg(short, long, default_value_t = 3979)]
        port: u16,

        #[arg(short, long, default_value = "Unnamed Server")]
        name: String,

        /// Show up in the public listing
        #[arg(long)]
        public: bool,
    },

    /// Fetch the public server listing
    List {
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,

        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },

    /// Connect to the server behind a join key
    Join {
        join_key: String,

        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CoordinatorConfig::load(path)?,
        None => CoordinatorConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        coordinator = %format!("{}:{}", config.coordinator_host, config.coordinator_port),
        stun = %format!("{}:{}", config.stun_host, config.stun_port),
        revision = %config.revision,
        "waypoint starting"
    );

    match cli.command {
        Command::Register { port, name, public } => run_register(config, port, name, public),
        Command::List { json, timeout_secs } => run_list(config, json, Duration::from_secs(timeout_secs)),
        Command::Join { join_key, timeout_secs } => {
            run_join(config, &join_key, Duration::from_secs(timeout_secs))
        }
    }
}

fn run_register(config: CoordinatorConfig, port: u16, name: String, public: bool) -> Result<()> {
    let revision = config.revision.clone();
    let mut client = CoordinatorClient::new(config);

    client.set_registration_observer(|registration| {
        if registration.is_registered() {
            println!(
                "Registered as {} ({})",
                registration.join_key, registration.connection_type
            );
        } else {
            println!("Not registered");
        }
    });
    client.set_incoming_handler(|stream: TcpStream| match stream.peer_addr() {
        Ok(peer) => println!("Player connected through STUN from {}", peer),
        Err(e) => warn!(error = %e, "incoming connection without peer address"),
    });

    let game_type = if public {
        ServerGameType::Public
    } else {
        ServerGameType::FriendsOnly
    };
    client.register(game_type, port, move || GameInfo {
        server_name: name.clone(),
        server_revision: revision.clone(),
        dedicated: true,
        clients_max: 25,
        companies_max: 15,
        spectators_max: 25,
        ..GameInfo::default()
    });

    loop {
        client.tick();
        thread::sleep(TICK);
    }
}

fn run_list(config: CoordinatorConfig, json: bool, timeout: Duration) -> Result<()> {
    let mut client = CoordinatorClient::new(config);
    client.get_listing();

    let deadline = Instant::now() + timeout;
    while client.is_listing() {
        if Instant::now() >= deadline {
            bail!("timed out waiting for the server listing");
        }
        client.tick();
        thread::sleep(TICK);
    }
    client.shutdown();

    if json {
        let out = serde_json::to_string_pretty(client.game_list().entries())
            .context("failed to serialize server listing")?;
        println!("{}", out);
        return Ok(());
    }

    if client.game_list().is_empty() {
        println!("No servers found");
    }
    for entry in client.game_list().entries() {
        let info = &entry.info;
        println!(
            "{:<10} {:<40} {:>3}/{:<3} {}{}",
            info.join_key,
            info.server_name,
            info.clients_on,
            info.clients_max,
            info.server_revision,
            if entry.compatible { "" } else { " (incompatible)" },
        );
    }
    Ok(())
}

fn run_join(config: CoordinatorConfig, join_key: &str, timeout: Duration) -> Result<()> {
    let mut client = CoordinatorClient::new(config);
    let result: Rc<RefCell<Option<Result<TcpStream, JoinError>>>> = Rc::new(RefCell::new(None));

    let sink = result.clone();
    client.connect_to_server(join_key, move |r| *sink.borrow_mut() = Some(r));

    let deadline = Instant::now() + timeout;
    while result.borrow().is_none() {
        if Instant::now() >= deadline {
            client.shutdown();
            bail!("timed out connecting to {}", join_key);
        }
        client.tick();
        thread::sleep(TICK);
    }
    client.shutdown();

    let outcome = result.borrow_mut().take();
    match outcome {
        Some(Ok(stream)) => {
            let peer = stream.peer_addr().context("connected socket has no peer")?;
            println!("Connected to {} at {}", join_key, peer);
            Ok(())
        }
        Some(Err(e)) => bail!("could not join {}: {}", join_key, e),
        None => bail!("join of {} produced no result", join_key),
    }
}
