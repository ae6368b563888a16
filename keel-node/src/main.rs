//! Keel Node
//!
//! Runnable consensus replica: recovers durable state, runs the replica
//! loop, bridges it to a UDP transport over a static peer table, and
//! offers a small stdin shell for submitting commands.

mod transport;

use clap::Parser;
use keel_core::{
    ClusterView, KvStateMachine, LogStore, MemberId, Outbound, PeerMessage, PersistentLog,
    Replica, ReplicaConfig, ReplicaContext, SubmitCommandRequest, VoteStore,
};
use serde_json::json;
use std::collections::HashMap;
use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// Keel consensus node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node name/identifier
    #[arg(short, long)]
    name: String,

    /// UDP port to listen on
    #[arg(short, long, default_value = "9700")]
    port: u16,

    /// Data directory for durable state
    #[arg(short, long, default_value = "./keel-data")]
    data_dir: PathBuf,

    /// Peer in the form id=host:port (repeat per peer)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn parse_peers(specs: &[String]) -> Result<HashMap<MemberId, SocketAddr>, String> {
    let mut peers = HashMap::new();
    for spec in specs {
        let (id, addr) = spec
            .split_once('=')
            .ok_or_else(|| format!("peer spec '{}' is not id=host:port", spec))?;
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| format!("peer address '{}': {}", addr, e))?;
        peers.insert(id.to_string(), addr);
    }
    Ok(peers)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Keel node \"{}\" starting", args.name);

    let peers = parse_peers(&args.peers)?;
    let config = ReplicaConfig::default();
    config.validate()?;

    // Recover durable state.
    let data_dir = args.data_dir.join(&args.name);
    let vote_store = VoteStore::new(&data_dir)?;
    let vote_state = vote_store.load()?;
    let (log_store, recovered) = LogStore::open(&data_dir, true)?;
    info!(
        "Recovered term {} with {} log entries",
        vote_state.current_term,
        recovered.len()
    );
    let log = PersistentLog::open(log_store, recovered)?;

    let mut member_ids: Vec<MemberId> = peers.keys().cloned().collect();
    member_ids.push(args.name.clone());
    let cluster = ClusterView::new(args.name.clone(), member_ids);

    let ctx = ReplicaContext::new(config, cluster, log, Box::new(KvStateMachine::new()))
        .with_vote_store(vote_store, vote_state);
    let (replica, handle, mut outbound_rx) = Replica::new(ctx);
    tokio::spawn(replica.run());

    // Transport.
    let mut transport = transport::Transport::new(args.port).await?;
    info!("Listening on {}", transport.local_addr()?);
    transport.start_receive();

    // Outbound pump: replica traffic onto the wire.
    let sender = transport.sender();
    let peer_table = peers.clone();
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            match message {
                Outbound::Send(member, msg) => match peer_table.get(&member) {
                    Some(addr) => {
                        let _ = sender.send(&msg, *addr).await;
                    }
                    None => warn!("No address for member {}", member),
                },
                Outbound::Broadcast(msg) => {
                    let addrs: Vec<SocketAddr> = peer_table.values().copied().collect();
                    let _ = sender.broadcast(&msg, &addrs).await;
                }
            }
        }
    });

    let addr_to_member: HashMap<SocketAddr, MemberId> =
        peers.iter().map(|(id, addr)| (*addr, id.clone())).collect();

    // Stdin shell for local commands.
    let (command_tx, mut command_rx) = tokio::sync::mpsc::channel::<(String, serde_json::Value)>(16);
    std::thread::spawn(move || {
        println!("\nCommands:");
        println!("  put <key> <value>   - Replicate a key-value write");
        println!("  get <key>           - Read a key through the log");
        println!("  remove <key>        - Delete a key");
        println!("  quit                - Exit\n");

        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            if let Ok(line) = line {
                let parts: Vec<&str> = line.trim().split_whitespace().collect();
                if parts.is_empty() {
                    continue;
                }

                match parts[0] {
                    "put" if parts.len() >= 3 => {
                        let value = serde_json::from_str(parts[2])
                            .unwrap_or_else(|_| serde_json::Value::String(parts[2].to_string()));
                        let _ = command_tx
                            .blocking_send(("put".to_string(), json!({"key": parts[1], "value": value})));
                    }
                    "get" if parts.len() >= 2 => {
                        let _ = command_tx
                            .blocking_send(("get".to_string(), json!({"key": parts[1]})));
                    }
                    "remove" if parts.len() >= 2 => {
                        let _ = command_tx
                            .blocking_send(("remove".to_string(), json!({"key": parts[1]})));
                    }
                    "quit" | "exit" => {
                        std::process::exit(0);
                    }
                    _ => {
                        println!("Unknown command. Try: put <key> <value>");
                    }
                }
            }
        }
    });

    // Main event loop: wire traffic in, shell commands through the handle.
    let reply_sender = transport.sender();
    loop {
        tokio::select! {
            Some((msg, src)) = transport.recv() => {
                let from = addr_to_member.get(&src).cloned();
                match msg {
                    PeerMessage::AppendEntries(req) => {
                        let handle = handle.clone();
                        let sender = reply_sender.clone();
                        tokio::spawn(async move {
                            if let Ok(resp) = handle.append_entries(req).await {
                                let _ = sender.send(&PeerMessage::AppendEntriesResponse(resp), src).await;
                            }
                        });
                    }
                    PeerMessage::RequestVote(req) => {
                        let handle = handle.clone();
                        let sender = reply_sender.clone();
                        tokio::spawn(async move {
                            if let Ok(resp) = handle.request_vote(req).await {
                                let _ = sender.send(&PeerMessage::RequestVoteResponse(resp), src).await;
                            }
                        });
                    }
                    PeerMessage::SubmitCommand(req) => {
                        let handle = handle.clone();
                        let sender = reply_sender.clone();
                        tokio::spawn(async move {
                            if let Ok(resp) = handle.submit_command(req).await {
                                let _ = sender.send(&PeerMessage::SubmitCommandResponse(resp), src).await;
                            }
                        });
                    }
                    PeerMessage::AppendEntriesResponse(resp) => {
                        match from {
                            Some(member) => { let _ = handle.notify_append_response(member, resp).await; }
                            None => warn!("Append response from unknown peer {}", src),
                        }
                    }
                    PeerMessage::RequestVoteResponse(resp) => {
                        match from {
                            Some(member) => { let _ = handle.notify_vote_response(member, resp).await; }
                            None => warn!("Vote response from unknown peer {}", src),
                        }
                    }
                    PeerMessage::SubmitCommandResponse(resp) => {
                        info!("Command {} completed remotely", resp.id);
                    }
                }
            }

            Some((command, command_args)) = command_rx.recv() => {
                let req = SubmitCommandRequest {
                    id: Uuid::new_v4(),
                    command,
                    args: command_args,
                };
                match handle.submit_command(req).await {
                    Ok(resp) => match (resp.result, resp.error) {
                        (Some(value), _) => println!("ok: {}", value),
                        (_, Some(message)) => println!("error: {}", message),
                        _ => println!("ok"),
                    },
                    Err(e) => println!("error: {}", e),
                }
            }
        }
    }
}
