//! Raidroom - collaborative raid planning rooms
//!
//! `raidroom serve` runs the relay; `create`, `join` and `share` are the
//! client side.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use raidroom_app::session::SessionEvent;
use raidroom_app::{
    share, Config, NetChannelFactory, RemoteStore, Result, RoomSession, RoomStoreAdapter,
    SessionIdentity, Transport,
};
use raidroom_core::{Database, Identity, Plan, UserId, Vote};
use raidroom_net::{RoomLink, Server, DEFAULT_PORT};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "raidroom", version, about = "Collaborative raid planning rooms")]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay that owns the room database
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        database: Option<PathBuf>,
    },
    /// Create a room and print its link
    Create {
        #[arg(long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))]
        server: SocketAddr,
        #[arg(long)]
        game: String,
        /// JSON file holding the initial plan
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Also copy the link to the clipboard
        #[arg(long)]
        copy: bool,
    },
    /// Join a room from the terminal
    Join {
        link: RoomLink,
        /// Display name (overrides the config)
        #[arg(long)]
        name: Option<String>,
    },
    /// Copy a room link to the clipboard
    Share { link: RoomLink },
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(error = %e, "Command failed");
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port, database } => serve(config, port, database).await,
        Commands::Create {
            server,
            game,
            plan,
            copy,
        } => create(config, server, game, plan, copy).await,
        Commands::Join { link, name } => join(config, link, name).await,
        Commands::Share { link } => {
            if share::copy_link(&link) {
                println!("Copied {}", link);
            } else {
                println!("{}", link);
            }
            Ok(())
        }
    }
}

async fn serve(config: Config, port: Option<u16>, database: Option<PathBuf>) -> Result<()> {
    let db_path = match database {
        Some(path) => path,
        None => config.database_path()?,
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::open(&db_path)?;
    info!(
        path = %db_path.display(),
        schema_version = db.schema_version(),
        "Database opened"
    );

    let mut server_config = config.server_config();
    if let Some(port) = port {
        server_config.port = port;
    }

    let server = Server::start(server_config, db).await?;
    if let Some(addr) = server.addr() {
        println!("Relay listening on {}", addr);
    }

    tokio::signal::ctrl_c().await?;
    server.shutdown();
    Ok(())
}

async fn create(
    config: Config,
    server: SocketAddr,
    game: String,
    plan_path: Option<PathBuf>,
    copy: bool,
) -> Result<()> {
    let plan: Option<Plan> = match plan_path {
        Some(path) => Some(serde_json::from_str(&std::fs::read_to_string(path)?)?),
        None => None,
    };
    let host_id = config.identity().map(|i| i.id).unwrap_or_default();

    let store = RemoteStore::connect(&Transport::Tcp(server)).await?;
    let room = store.create_room(host_id, game, plan).await?;
    store.close().await;

    let link = RoomLink::new(server, room.id);
    println!("{}", link);
    if copy && !share::copy_link(&link) {
        warn!("Could not copy link to clipboard");
    }
    Ok(())
}

async fn join(config: Config, link: RoomLink, name: Option<String>) -> Result<()> {
    let identity = match (name, config.identity()) {
        (Some(name), Some(identity)) => Some(Identity {
            display_name: name,
            ..identity
        }),
        (Some(name), None) => Some(Identity::new(UserId::new(), name)),
        (None, identity) => identity,
    };
    if identity.is_none() {
        println!("No identity configured; joining read-only");
    }

    let transport = Transport::Tcp(link.socket_addr());
    let store = Arc::new(RemoteStore::connect(&transport).await?);
    let mut session = RoomSession::new(
        link.room_id,
        SessionIdentity::new(identity),
        store,
        NetChannelFactory::new(transport),
        config.session_options(),
    );

    session.start().await?;
    print_room(&session);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            update = session.next_update() => match update {
                Some(SessionEvent::Disconnected) | None => {
                    println!("-- connection lost, reconnecting");
                    session.reconnect().await?;
                    print_room(&session);
                }
                Some(event) => print_event(&session, &event),
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_input(&mut session, line.trim()).await {
                    break;
                }
            }
        }
    }

    session.release().await;
    Ok(())
}

type CliSession = RoomSession<RemoteStore, NetChannelFactory, SessionIdentity>;

/// Returns false when the user asked to leave
async fn handle_input(session: &mut CliSession, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let result = match parts.next() {
        None => Ok(()),
        Some("/quit") => return false,
        Some("/vote") => match (parse_index(parts.next()), parts.next()) {
            (Some(index), Some("keep")) => session.vote(index, Vote::Keep).await.map(|_| ()),
            (Some(index), Some("reroll")) => session.vote(index, Vote::Reroll).await.map(|_| ()),
            _ => usage("/vote <phase> keep|reroll"),
        },
        Some(cmd @ ("/assign" | "/unassign")) => {
            match (parse_index(parts.next()), parts.next(), session.identity()) {
                (Some(index), Some(role), Some(me)) if cmd == "/assign" => {
                    session.assign_role(index, role, me.id).await.map(|_| ())
                }
                (Some(index), Some(role), Some(me)) => {
                    session.unassign_role(index, role, me.id).await.map(|_| ())
                }
                _ => usage("/assign|/unassign <phase> <role>"),
            }
        }
        Some("/gif") => match parts.next() {
            Some(url) => session.send_gif(url).await,
            None => usage("/gif <url>"),
        },
        Some("/who") => {
            for record in session.assignable_participants() {
                println!("   {} ({})", record.username, record.color);
            }
            Ok(())
        }
        Some(_) => session.send_message(line).await,
    };

    if let Err(e) = result {
        // Nothing synced; the user can try again
        println!("-- failed: {}", e);
    }
    true
}

fn parse_index(arg: Option<&str>) -> Option<usize> {
    arg?.parse().ok()
}

fn usage(text: &str) -> Result<()> {
    println!("usage: {}", text);
    Ok(())
}

fn print_room(session: &CliSession) {
    let view = session.view();
    match &view.room_state {
        Some(plan) if view.has_plan() => {
            println!("== {} ({}: {})", plan.title, plan.game, plan.raid);
            for (i, phase) in plan.phases.iter().enumerate() {
                let (keep, reroll) = phase.tally();
                println!(
                    "  [{}] {} - {} min  keep {} / reroll {}",
                    i, phase.name, phase.time, keep, reroll
                );
            }
        }
        _ => println!("== Waiting for the host to start a plan"),
    }
    for message in &view.chat_messages {
        println!("<{}> {}", message.username, message.content);
    }
}

fn print_event(session: &CliSession, event: &SessionEvent) {
    match event {
        SessionEvent::RoomLoaded(_) | SessionEvent::Subscribed => print_room(session),
        SessionEvent::MessageInserted(message) => {
            println!("<{}> {}", message.username, message.content)
        }
        SessionEvent::PresenceJoin { record, .. } => println!("-- {} joined", record.username),
        SessionEvent::PresenceLeave { record, .. } => println!("-- {} left", record.username),
        SessionEvent::PresenceSync(_) => println!(
            "-- {} online ({} connections)",
            session.online_user_count(),
            session.connection_count()
        ),
        _ => {}
    }
}

