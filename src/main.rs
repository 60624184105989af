use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::time;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use peerchat::{
    DEFAULT_GOSSIP_FANOUT, DEFAULT_RATE_LIMIT_WINDOW, Directory, DirectoryConfig, Message,
    MessageSink, PROTOCOL_ID, Peer, PeerConfig, PeerId, RateLimit,
};

const DEFAULT_TOPIC: &str = "crew-room";

#[derive(Parser, Debug)]
#[command(name = "peerchat")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Subscribers reached per gossip step.
    #[arg(long, global = true, default_value_t = DEFAULT_GOSSIP_FANOUT)]
    fanout: usize,

    /// Seed for gossip shuffles and neighbor sampling.
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Limit each peer to this many sends per minute.
    #[arg(long, global = true, value_name = "MESSAGES")]
    rate_limit: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the four-peer walkthrough (default).
    Demo,
    /// Start a single peer and report its status until Ctrl+C.
    Node {
        #[arg(long)]
        id: String,

        #[arg(short = 'B', long, value_name = "PEER", value_delimiter = ',')]
        bootstrap: Vec<String>,

        #[arg(long, default_value = DEFAULT_TOPIC)]
        topic: String,

        #[arg(long, default_value = "30")]
        status_interval: u64,
    },
}

impl Args {
    fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            gossip_fanout: self.fanout,
            send_rate_limit: self.rate_limit.map(|max_messages| RateLimit {
                max_messages,
                window: DEFAULT_RATE_LIMIT_WINDOW,
            }),
            ..PeerConfig::default()
        }
    }

    fn directory(&self) -> Arc<Directory> {
        Arc::new(Directory::new(DirectoryConfig {
            rng_seed: self.seed,
            ..DirectoryConfig::default()
        }))
    }
}

/// Prints every accepted message as a chat line on stdout.
struct PrintSink {
    owner: PeerId,
}

#[async_trait]
impl MessageSink for PrintSink {
    async fn on_direct(&self, message: &Message) {
        println!(
            "[{}] DM from {}: {}",
            self.owner,
            message.sender(),
            message.content()
        );
    }

    async fn on_group(&self, message: &Message) {
        println!(
            "[{}] #{} <{}> {}",
            self.owner,
            message.topic().unwrap_or_default(),
            message.sender(),
            message.content()
        );
    }
}

fn spawn_peer(id: &str, directory: &Arc<Directory>, config: &PeerConfig) -> Peer {
    let sink = Arc::new(PrintSink { owner: id.into() });
    Peer::with_options(id, directory.clone(), config.clone(), sink)
}

async fn start_peer(peer: &Peer, bootstrap: &[&str]) -> Result<()> {
    let bootstrap: Vec<PeerId> = bootstrap.iter().map(|id| PeerId::from(*id)).collect();
    peer.start(&bootstrap)
        .await
        .with_context(|| format!("failed to start peer {}", peer.peer_id()))
}

async fn run_demo(args: &Args) -> Result<()> {
    let directory = args.directory();
    let config = args.peer_config();

    let alpha = spawn_peer("alpha", &directory, &config);
    let bravo = spawn_peer("bravo", &directory, &config);
    let charlie = spawn_peer("charlie", &directory, &config);
    let delta = spawn_peer("delta", &directory, &config);

    println!("== {} demo ==", PROTOCOL_ID);

    start_peer(&alpha, &[]).await?;
    alpha.subscribe(DEFAULT_TOPIC).await;
    start_peer(&bravo, &["alpha"]).await?;
    bravo.subscribe(DEFAULT_TOPIC).await;
    start_peer(&charlie, &["bravo"]).await?;
    charlie.subscribe(DEFAULT_TOPIC).await;

    println!("-- direct messages");
    alpha.send_direct_message(bravo.peer_id(), "ping").await?;
    directory.settle().await;
    bravo.send_direct_message(alpha.peer_id(), "pong").await?;
    alpha
        .send_direct_message(delta.peer_id(), "welcome aboard, delta")
        .await?;
    directory.settle().await;
    println!(
        "delta is offline; mailbox holds {} message(s)",
        directory.mailbox_len(delta.peer_id()).await
    );

    println!("-- gossip on #{}", DEFAULT_TOPIC);
    delta.subscribe(DEFAULT_TOPIC).await;
    alpha.publish_to_topic(DEFAULT_TOPIC, "hello crew").await?;
    directory.settle().await;
    bravo
        .publish_to_topic(DEFAULT_TOPIC, "systems nominal")
        .await?;
    directory.settle().await;

    println!("-- delta joins late");
    start_peer(&delta, &["alpha", "charlie"]).await?;
    directory.settle().await;
    let merged = delta.request_history_from_neighbors(3, 10).await;
    println!("delta pulled {} message(s) from neighbors", merged.len());

    println!("-- summary");
    for peer in [&alpha, &bravo, &charlie, &delta] {
        let stats = peer.stats();
        println!(
            "{:<8} log={:<2} accepted={:<2} duplicates={:<2} rejected={} connected={:?}",
            peer.peer_id().as_str(),
            peer.message_log_snapshot().await.len(),
            stats.accepted,
            stats.duplicates,
            stats.rejected,
            peer.connected_peers()
                .await
                .iter()
                .map(PeerId::as_str)
                .collect::<Vec<_>>(),
        );
    }

    for peer in [&alpha, &bravo, &charlie, &delta] {
        peer.stop().await;
    }
    Ok(())
}

async fn run_node(
    args: &Args,
    id: &str,
    bootstrap: &[String],
    topic: &str,
    status_interval: u64,
) -> Result<()> {
    let directory = args.directory();
    let peer = spawn_peer(id, &directory, &args.peer_config());

    let bootstrap: Vec<&str> = bootstrap.iter().map(String::as_str).collect();
    start_peer(&peer, &bootstrap).await?;
    peer.subscribe(topic).await;
    info!(peer = %peer.peer_id(), topic = topic, protocol = PROTOCOL_ID, "node ready");

    let mut interval = time::interval(Duration::from_secs(status_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let stats = peer.stats();
                info!(
                    peer = %peer.peer_id(),
                    running = peer.is_running().await,
                    connected = peer.connected_peers().await.len(),
                    subscriptions = ?peer.subscriptions().await,
                    log = peer.message_log_snapshot().await.len(),
                    accepted = stats.accepted,
                    rejected = stats.rejected,
                    "status"
                );
            }
        }
    }

    peer.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match &args.command {
        None | Some(Command::Demo) => run_demo(&args).await,
        Some(Command::Node {
            id,
            bootstrap,
            topic,
            status_interval,
        }) => run_node(&args, id, bootstrap, topic, *status_interval).await,
    }
}
