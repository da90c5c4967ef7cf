//! Rendezvous CLI - peer connection negotiation and resumable file transfer
//!
//! Runs a rendezvous proxy, or negotiates a transfer between two in-process
//! peers to exercise the engine end to end.

use clap::Parser;
use rendezvous::checksum::{ChecksumEngine, FileChecksum};
use rendezvous::config::{parse_size, CliArgs, Commands, RendezvousConfig};
use rendezvous::control::{LoopbackChannel, PeerId};
use rendezvous::error::{IoResultExt, Result, RendezvousError};
use rendezvous::progress::ProgressReporter;
use rendezvous::proxy::ProxyServer;
use rendezvous::rendezvous::{
    ConnectionListener, ConnectionManager, ConnectionState, IncomingFileTransfer, ManagerListener, RvEvent,
};
use rendezvous::transfer::TransferItem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Initialize logging; RUST_LOG wins over -v
    let default_level = match (args.quiet, args.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }

    match run(&args) {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run(args: &CliArgs) -> Result<bool> {
    let config = RendezvousConfig::from_cli(args)?;

    match &args.command {
        Commands::Proxy { bind, public_ip } => cmd_proxy(*bind, *public_ip),
        Commands::Loopback {
            files,
            dest,
            external_proxy,
        } => cmd_loopback(config, files, dest, *external_proxy, args.quiet),
        Commands::Checksum { file, length } => cmd_checksum(&config, file, length.as_deref()),
    }
}

fn cmd_proxy(bind: SocketAddr, public_ip: Option<Ipv4Addr>) -> Result<bool> {
    let server = ProxyServer::bind(bind, public_ip)?;
    let local = server.local_addr().with_target(bind)?;
    println!("Rendezvous proxy listening on {}", local);
    server.run()?;
    Ok(true)
}

/// Accepts every offer into a destination directory
struct AutoAccept {
    dest: PathBuf,
}

impl ManagerListener for AutoAccept {
    fn new_incoming(&self, transfer: &IncomingFileTransfer) {
        if let Some(description) = transfer.description() {
            tracing::info!(
                peer = %transfer.connection().peer(),
                name = %description.name,
                files = description.file_count,
                "Accepting offer"
            );
        }
        if let Err(e) = transfer.accept(self.dest.clone()) {
            tracing::error!("Could not accept transfer: {}", e);
        }
    }
}

fn peer_config(base: &RendezvousConfig, name: &str) -> RendezvousConfig {
    let mut config = base.clone();
    config.screen_name = name.to_string();
    if config.listen_addr.ip().is_unspecified() {
        config.listen_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), config.listen_addr.port());
    }
    if config.advertised_lan_ip.is_none() {
        config.advertised_lan_ip = Some(config.listen_addr.ip());
    }
    config
}

fn cmd_loopback(
    mut config: RendezvousConfig,
    files: &[PathBuf],
    dest: &Path,
    external_proxy: bool,
    quiet: bool,
) -> Result<bool> {
    std::fs::create_dir_all(dest).with_path(dest)?;
    let items = TransferItem::collect(files)?;

    // Embedded proxy so the proxied strategies have somewhere to go
    let proxy = if external_proxy {
        None
    } else {
        let server = ProxyServer::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), None)?;
        let addr = server.local_addr().with_target("embedded proxy")?;
        config.proxy_host = addr.ip().to_string();
        config.proxy_port = addr.port();
        let shutdown = server.shutdown_flag();
        let handle = thread::Builder::new()
            .name("rv-proxy".to_string())
            .spawn(move || server.run())
            .map_err(|e| RendezvousError::connection(addr, e))?;
        tracing::info!(%addr, "Embedded proxy started");
        Some((shutdown, handle))
    };

    let ((alice_channel, alice_inbox), (bob_channel, bob_inbox)) =
        LoopbackChannel::pair(PeerId::from("alice"), PeerId::from("bob"));
    let alice = Arc::new(ConnectionManager::new(peer_config(&config, "alice"), Arc::new(alice_channel))?);
    let bob = Arc::new(ConnectionManager::new(peer_config(&config, "bob"), Arc::new(bob_channel))?);
    alice.attach_inbox(alice_inbox)?;
    bob.attach_inbox(bob_inbox)?;
    bob.add_listener(Arc::new(AutoAccept {
        dest: dest.to_path_buf(),
    }));

    let transfer = alice.create_outgoing_transfer(PeerId::from("bob"), items)?;
    let reporter = Arc::new(if quiet {
        ProgressReporter::disabled()
    } else {
        ProgressReporter::new()
    });
    let connection = transfer.connection().clone();
    connection.add_listener(Arc::clone(&reporter) as Arc<dyn ConnectionListener>);
    transfer.send_request()?;

    while !connection.is_done() {
        thread::sleep(Duration::from_millis(50));
    }
    // Let the last notification reach the reporter
    while !reporter.is_finished() {
        thread::sleep(Duration::from_millis(10));
    }

    let succeeded = connection.state() == ConnectionState::Finished;
    if !quiet {
        match connection.last_event() {
            Some(RvEvent::TransferComplete(_)) => reporter.summary().print(),
            Some(event) => eprintln!("Transfer failed: {}", event),
            None => {}
        }
    }

    drop((alice, bob));
    if let Some((shutdown, handle)) = proxy {
        shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Ok(Err(e)) = handle.join() {
            tracing::warn!("Embedded proxy stopped with error: {}", e);
        }
    }
    Ok(succeeded)
}

fn cmd_checksum(config: &RendezvousConfig, file: &Path, length: Option<&str>) -> Result<bool> {
    let engine = ChecksumEngine::new(config.buffer_size);
    let size = std::fs::metadata(file).with_path(file)?.len();
    let len = match length {
        Some(length) => parse_size(length).map_err(RendezvousError::config)?.min(size),
        None => size,
    };

    let state = engine.compute(file, FileChecksum::new(), len, |_| ControlFlow::Continue(()))?;
    println!("{:#010x}  {} bytes  {}", state.value(), len, file.display());
    Ok(true)
}
