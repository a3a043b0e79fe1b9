//! `fileshare-demo` — a minimal interactive client over the engine.
//!
//! Advertises on the LAN, prints peers as they come and go, prompts for
//! authorization on incoming transfer requests, and accepts a one-shot
//! `--send <peer> <file>...` to push files to a peer as soon as it's seen.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use fileshare_p2p::discovery::mdns::MdnsBackend;
use fileshare_p2p::discovery::DiscoveryBackend;
use fileshare_p2p::node::{Node, NodeEvent};
use fileshare_p2p::transfer::FileSource;
use fileshare_p2p::{identity, EngineConfig};

#[derive(Parser, Debug)]
#[command(name = "fileshare-demo", about = "LAN peer-to-peer file sharing demo client")]
struct Args {
    /// Override the device name instead of deriving one from the hostname.
    #[arg(long)]
    name: Option<String>,

    /// Use randomized peer-N names, useful for running several instances
    /// on one machine.
    #[arg(long)]
    debug: bool,

    /// Directory incoming files are written into.
    #[arg(long, default_value = ".")]
    download_dir: PathBuf,

    /// TCP port for signalling and mDNS identity. 0 picks an unused port.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Peer name to send files to as soon as it's discovered.
    #[arg(long, requires = "files")]
    send: Option<String>,

    /// Files to send when `--send` is given. Repeat `--file` for each one.
    #[arg(long = "file", requires = "send")]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let device_name = match args.name {
        Some(n) => n,
        None => identity::device_name(args.debug)?,
    };
    let ip = identity::outbound_ip()?;

    let config = EngineConfig::new(device_name.clone(), ip, args.download_dir).with_signalling_port(args.port);

    println!("starting as '{device_name}' on {ip}");

    let backend: Arc<dyn DiscoveryBackend> = Arc::new(MdnsBackend::new()?);
    let handle = Node::spawn(config, backend).await?;

    let mut logs = handle.subscribe_logs();
    tokio::spawn(async move {
        while let Ok(entry) = logs.recv().await {
            eprintln!("[{} {}] {}", entry.level, entry.target, entry.message);
        }
    });

    let pending_send = args.send.map(|peer| (peer, args.files));
    let mut events = handle.subscribe_events();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Ok(event) = event else { break };
                match event {
                    NodeEvent::PeerAdded { peer_id } => {
                        println!("+ peer {peer_id}");
                        if let Some((target, files)) = &pending_send {
                            if target == &peer_id {
                                let sources = files
                                    .iter()
                                    .map(|p| FileSource {
                                        name: p.file_name().unwrap_or_default().to_string_lossy().into_owned(),
                                        path: p.clone(),
                                    })
                                    .collect();
                                match handle.send_files(vec![peer_id.clone()], sources).await {
                                    Ok(id) => println!("sending transfer {id} to {peer_id}"),
                                    Err(e) => eprintln!("failed to start transfer: {e}"),
                                }
                            }
                        }
                    }
                    NodeEvent::PeerRemoved { peer_id } => {
                        println!("- peer {peer_id}");
                    }
                    NodeEvent::TransferRequest { from_peer, request } => {
                        println!(
                            "{} wants to send files ({}): accept? [y/N]",
                            from_peer, request.human_message
                        );
                        let authorized = matches!(
                            stdin.next_line().await?,
                            Some(line) if line.trim().eq_ignore_ascii_case("y")
                        );
                        if let Err(e) = handle
                            .respond_to_transfer(from_peer, request.transfer_id, authorized)
                            .await
                        {
                            eprintln!("failed to respond: {e}");
                        }
                    }
                    NodeEvent::NotifyCompletion(n) => {
                        println!("{}", n.message);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("shutting down");
                handle.shutdown().await;
                break;
            }
        }
    }

    Ok(())
}
