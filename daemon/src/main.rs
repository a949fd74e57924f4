use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use quadvolt_usb::registry::{DeviceRegistry, RegistryEvent};
use quadvolt_usb::session::{DeviceSession, SessionEvent};
use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use crate::cli::{Cli, LevelFilter};

mod cli;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let args: Cli = Cli::parse();

    CombinedLogger::init(vec![TermLogger::new(
        match args.log_level {
            LevelFilter::Off => log::LevelFilter::Off,
            LevelFilter::Error => log::LevelFilter::Error,
            LevelFilter::Warn => log::LevelFilter::Warn,
            LevelFilter::Info => log::LevelFilter::Info,
            LevelFilter::Debug => log::LevelFilter::Debug,
            LevelFilter::Trace => log::LevelFilter::Trace,
        },
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )])
    .context("Could not configure the logger")?;

    info!("Starting QuadVolt Daemon v{}", VERSION);

    let registry = DeviceRegistry::start();
    let mut events = registry.subscribe();

    loop {
        tokio::select! {
            Ok(()) = signal::ctrl_c() => {
                info!("Shutting down daemon");
                break;
            }
            event = events.recv() => {
                match event {
                    Ok(RegistryEvent::Connected(session)) => {
                        tokio::spawn(run_device(session, args.json));
                    }
                    Ok(RegistryEvent::Disconnected(identifier)) => {
                        info!("[{}] Device removed", identifier);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Dropped {} registry events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    // Close anything still open before the registry goes away.
    for identifier in registry.devices().await {
        if let Some(session) = registry.get(&identifier).await {
            if let Err(e) = session.close().await {
                warn!("[{}] Error closing session: {}", identifier, e);
            }
        }
    }
    registry.stop().await;

    Ok(())
}

// One task per attached sampler: open it, start the stream, and relay
// whatever the session reports until it ends.
async fn run_device(session: DeviceSession, json: bool) {
    let identifier = session.id();
    let mut events = session.subscribe();

    if let Err(e) = session.open().await {
        error!("[{}] Unable to open device: {}", identifier, e);
        return;
    }
    if let Err(e) = session.start().await {
        error!("[{}] Unable to start sampling: {}", identifier, e);
        return;
    }

    loop {
        match events.recv().await {
            Ok(SessionEvent::Sample(sample)) => {
                if json {
                    match serde_json::to_string(&sample) {
                        Ok(line) => println!("{line}"),
                        Err(e) => warn!("[{}] Unable to serialise sample: {}", identifier, e),
                    }
                } else {
                    info!("[{}] {}", identifier, sample);
                }
            }
            Ok(SessionEvent::Error(e)) => {
                warn!("[{}] {}", identifier, e);
            }
            Ok(SessionEvent::Disconnected) | Ok(SessionEvent::Closed) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("[{}] Dropped {} session events", identifier, skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }

    info!("[{}] Monitor stopped", identifier);
}
