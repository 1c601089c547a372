use clap::{Args, Parser, Subcommand};
use roomlink::config::ChatConfig;
use roomlink::logging::init_logger;
use roomlink::model::{PeerId, Sender};
use roomlink::network::tcp::{PeerDirectory, TcpTransport, DEFAULT_PORT};
use roomlink::session::room_id::canonical_room_id;
use roomlink::session::{spawn_node, NodeHandle, SessionEvent, SessionEventReceiver};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "roomlink")]
#[command(about = "Terminal group chat: host a room or join one over TCP")]
struct Cli {
    /// JSON config file. Missing files fall back to defaults.
    #[arg(long, global = true, default_value = "roomlink.json")]
    config: PathBuf,

    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Create a room and wait for members.
    Host {
        #[command(flatten)]
        peer: PeerArgs,
        /// Reuse a fixed identity so the room id survives restarts.
        #[arg(long)]
        id: Option<String>,
    },
    /// Join a room by id or share link.
    Join {
        room: String,
        #[command(flatten)]
        peer: PeerArgs,
        /// Where the room's host listens.
        #[arg(long)]
        host_addr: SocketAddr,
    },
}

#[derive(Args)]
struct PeerArgs {
    #[arg(long)]
    name: String,
    /// Listen address. Hosts default to port 17401, members to any port.
    #[arg(long)]
    listen: Option<SocketAddr>,
}

impl PeerArgs {
    fn listen_or(&self, port: u16) -> SocketAddr {
        self.listen
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], port)))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_dir)?;
    let config = ChatConfig::load(&cli.config)?;

    let directory = PeerDirectory::new();
    let (node, events) = match cli.command {
        Mode::Host { peer, id } => {
            let transport = TcpTransport::new(peer.listen_or(DEFAULT_PORT), directory);
            let (node, events) = spawn_node(config, Arc::new(transport));
            match id {
                Some(id) => node.start_with_id(&peer.name, PeerId::new(id))?,
                None => node.start(&peer.name)?,
            }
            node.create_room(&peer.name)?;
            (node, events)
        }
        Mode::Join {
            room,
            peer,
            host_addr,
        } => {
            directory.insert(PeerId::new(canonical_room_id(&room)), host_addr);
            let transport = TcpTransport::new(peer.listen_or(0), directory);
            let (node, events) = spawn_node(config, Arc::new(transport));
            node.start(&peer.name)?;
            node.join_room(&room)?;
            (node, events)
        }
    };

    run_terminal(&node, events).await;
    node.shutdown().await;
    log::logger().flush();
    Ok(())
}

/// Print session events and forward stdin lines until EOF or `/quit`.
async fn run_terminal(node: &NodeHandle, mut events: SessionEventReceiver) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("stdin: {e}");
                        break;
                    }
                };
                if !handle_input(node, line.trim()).await {
                    break;
                }
            }
        }
    }
}

async fn handle_input(node: &NodeHandle, input: &str) -> bool {
    let sent = match input {
        "" => Ok(()),
        "/quit" => return false,
        "/leave" => node.leave_room(),
        "/users" => match node.snapshot().await {
            Ok(snapshot) => {
                match snapshot.room {
                    Some(room) => {
                        for user in &room.users {
                            println!("  {} ({})", user.display_name, user.id);
                        }
                    }
                    None => println!("  not in a room"),
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        "/rooms" => node.snapshot().await.map(|snapshot| {
            let current = snapshot.room.map(|r| r.id);
            for room in &snapshot.rooms {
                let marker = if Some(&room.id) == current.as_ref() { "*" } else { " " };
                println!(" {marker} {} ({})", room.name, room.id);
            }
        }),
        text => node.send_message(text),
    };
    if let Err(e) = sent {
        eprintln!("{e}");
        return false;
    }
    true
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Ready { id } => println!("* ready as {id}"),
        SessionEvent::RoomCreated { room_id, share_link } => {
            println!("* hosting room {room_id}");
            println!("* share: {share_link}");
        }
        SessionEvent::Joined { room_id, users } => {
            println!("* joined {room_id} ({} online)", users.len())
        }
        SessionEvent::Left { room_id } => println!("* left {room_id}"),
        SessionEvent::UserJoined(_) | SessionEvent::UserLeft(_) => {}
        SessionEvent::MessageAdded(message) => {
            let stamp = message.timestamp.format("%H:%M");
            match &message.sender {
                Sender::System => println!("[{stamp}] * {}", message.content),
                Sender::Peer(_) => println!(
                    "[{stamp}] <{}> {}",
                    message.sender_name.as_deref().unwrap_or("?"),
                    message.content
                ),
            }
        }
        SessionEvent::HostDisconnected { room_id } => {
            println!("* host of {room_id} disconnected, room is read-only")
        }
        SessionEvent::Error(e) => eprintln!("! {e}"),
    }
}
