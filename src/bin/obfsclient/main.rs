//! obfsclient: client-side pluggable transport dispatcher.
//!
//! Launched by Tor as a managed transport.  Reads the PT environment,
//! binds one SOCKS5 listener per supported requested method, reports the
//! listener addresses on stdout, then serves sessions until the parent
//! dies or interrupts us: the first SIGINT closes the listeners and lets
//! live sessions drain, the second tears the sessions down too.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

use obfsclient::pt::{self, ClientInfo};
use obfsclient::session::SessionSet;
use obfsclient::socks5::Socks5Server;
use obfsclient::transport::Transport;

const LOG_FILE_NAME: &str = "obfsclient.log";

/// Tunnel SOCKS5 traffic through obfuscated transport connections
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Disable the address scrubber on logging
    #[arg(long, default_value_t = false)]
    unsafe_logs: bool,

    /// Sleep after parsing command line args until a debugger attaches
    #[arg(long, default_value_t = false)]
    wait_for_debugger: bool,
}

// Logs go to a file in the state directory only; stdout belongs to the PT
// protocol.
fn init_logging(info: &ClientInfo, debug: bool) -> Result<()> {
    let file = std::fs::File::create(info.state_dir.join(LOG_FILE_NAME))
        .context("failed to create log file")?;

    let level = if debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .with_max_level(level)
        .init();

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // A debugger flips the flag through the raw pointer and we fall out of
    // the loop.
    let wait = args.wait_for_debugger;
    while unsafe { std::ptr::read_volatile(&wait) } {
        std::thread::sleep(Duration::from_millis(100));
    }

    // The PT handshake writes its own ENV-ERROR/VERSION-ERROR lines.
    let client_info = ClientInfo::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let _log_guard = if args.unsafe_logs {
        safelog::disable_safe_logging().context("failed to disable safe logging")?
    } else {
        safelog::enforce_safe_logging().context("failed to enforce safe logging")?
    };
    init_logging(&client_info, args.debug)?;

    info!(
        "obfsclient {} initialized (pid: {})",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    );

    // One listener per supported requested method; a failure on one method
    // does not stop the others.
    let mut servers = Vec::new();
    let mut session_sets: Vec<SessionSet> = Vec::new();
    for name in &client_info.methods {
        let Some(transport) = Transport::from_name(name) else {
            pt::report_cmethod_error(name, "no such method");
            continue;
        };
        match Socks5Server::bind(transport).await {
            Err(e) => pt::report_cmethod_error(name, &format!("bind failed: {e}")),
            Ok(server) => {
                let addr = server.local_addr().map_err(|e| anyhow::anyhow!("{e}"))?;
                info!("{name}: socks5 listener at {addr}");
                pt::report_cmethod(name, addr);
                session_sets.push(server.sessions());
                servers.push(server);
            }
        }
    }
    pt::report_methods_done();

    if servers.is_empty() {
        info!("no supported transports found, exiting");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let mut listener_tasks = Vec::new();
    for server in servers {
        listener_tasks.push(tokio::spawn(server.run(cancel.clone())));
    }

    info!("awaiting incoming connections");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigterm.recv() => {
            info!("received SIGTERM, exiting");
            return Ok(());
        }
        _ = sigint.recv() => {
            info!("closing all listeners");
            cancel.cancel();
        }
    }

    // First SIGINT is done; existing sessions keep draining until a second
    // interrupt (or a SIGTERM) arrives.
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }

    info!("closing all sessions");
    for sessions in &session_sets {
        sessions.abort_all();
    }
    for task in listener_tasks {
        let _ = task.await;
    }

    Ok(())
}
