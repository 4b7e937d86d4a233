//! ping-pong: two processes talking through postbox mailboxes.
//!
//! # Usage
//!
//! ```bash
//! ping-pong serve --name pong
//! ping-pong ping --name ping --peer pong --count 5
//! ```
//!
//! Both sides run in the same login session; the session suffix keeps them
//! apart from other sessions on the host.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use postbox::{
    Ack, CommandEnvelope, Controller, ControllerConfig, Identity, IpcError, LoginSession,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ping-pong")]
#[command(about = "Ping/pong between two processes over shared-memory mailboxes")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer every Ping with a Pong.
    Serve {
        /// Identity of this process
        #[arg(long)]
        name: String,
        /// Receive poll interval in milliseconds
        #[arg(long, default_value_t = 50)]
        interval_ms: u64,
    },
    /// Send Pings to a server and wait for the Pongs.
    Ping {
        /// Identity of this process
        #[arg(long)]
        name: String,
        /// Identity of the server
        #[arg(long)]
        peer: String,
        /// Number of pings to send
        #[arg(long, default_value_t = 5)]
        count: u32,
        /// Milliseconds between pings
        #[arg(long, default_value_t = 200)]
        interval_ms: u64,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    n: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    n: u32,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let args = Args::parse();

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to create runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = rt.block_on(async {
        match args.command {
            Command::Serve { name, interval_ms } => serve(&name, interval_ms).await,
            Command::Ping {
                name,
                peer,
                count,
                interval_ms,
            } => ping(&name, &peer, count, interval_ms).await,
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "ping-pong failed");
            ExitCode::FAILURE
        }
    }
}

fn controller(name: &str) -> Result<Controller, IpcError> {
    Controller::builder(name)
        .config(ControllerConfig::from_env()?)
        .session_suffix(LoginSession)
        .initialize()
}

async fn serve(name: &str, interval_ms: u64) -> Result<(), IpcError> {
    let controller = controller(name)?;
    let (tx, mut rx) = mpsc::unbounded_channel::<(Identity, u32)>();
    controller.register("Ping", move |sender: &Identity, ping: Ping| {
        tx.send((sender.clone(), ping.n))?;
        Ok(())
    })?;

    tracing::info!(identity = %controller.identity(), "serving");

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        controller.receive();
        // Handlers run under the mailbox lock; reply once it is released.
        while let Ok((sender, n)) = rx.try_recv() {
            tracing::info!(from = %sender, n, "ping");
            let pong = CommandEnvelope::new("Pong", &Pong { n })?;
            if let Err(e) = controller.send(&pong, sender.as_str()) {
                tracing::warn!(to = %sender, error = %e, "could not answer");
            }
        }
    }

    tracing::info!("shutting down");
    Ok(())
}

async fn ping(name: &str, peer: &str, count: u32, interval_ms: u64) -> Result<(), IpcError> {
    let controller = controller(name)?;
    controller.add_peer(peer);

    let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
    controller.register("Pong", move |_: &Identity, pong: Pong| {
        tx.send(pong.n)?;
        Ok(())
    })?;

    let acks = Arc::new(AtomicUsize::new(0));
    let acked = Arc::clone(&acks);
    controller.on_ack(move |_: &Identity, _: Ack| {
        acked.fetch_add(1, Ordering::Relaxed);
    });

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    let mut sent = 0u32;
    let mut pongs = 0u32;
    while pongs < count {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        controller.receive();
        while let Ok(n) = rx.try_recv() {
            pongs += 1;
            tracing::info!(n, "pong");
        }

        if sent < count {
            let envelope = CommandEnvelope::new("Ping", &Ping { n: sent })?;
            match controller.send(&envelope, peer) {
                Ok(id) => {
                    tracing::debug!(%id, n = sent, "sent ping");
                    sent += 1;
                }
                Err(e) => tracing::warn!(error = %e, "ping not sent, retrying"),
            }
        }
    }

    tracing::info!(
        sent,
        pongs,
        acks = acks.load(Ordering::Relaxed),
        "done"
    );
    Ok(())
}
