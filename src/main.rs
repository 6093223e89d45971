//! Audio Relay — receives PCM streams over TCP and plays them on one local
//! output device.
//!
//! ## Structure
//! 1. **Scheduler** (`reactor`): a single-threaded poll loop drives listener
//!    and connection sessions as resumable state machines.
//! 2. **Sessions** (`net::session`): 7-byte header negotiation, then
//!    fixed-size block streaming, one state machine per socket.
//! 3. **Pipeline** (`pipeline`): per-connection bounded queue + consumer
//!    thread writing blocks to the output device, shedding load when behind.
//!
//! Connections are independent: a failing one is logged and torn down while
//! the rest keep playing.

mod cli;
mod config;
mod device;
mod net;
mod pipeline;
mod queue;
mod reactor;
mod wire;

use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::Parser;
use cpal::traits::DeviceTrait;
use tracing_subscriber::EnvFilter;

use reactor::{Readiness, Scheduler, SessionEntry};

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let host = cpal::default_host();
    if args.list_devices {
        device::list_devices(&host)?;
        return Ok(());
    }

    let settings = config::load_or_create(&args.config)?;
    let bind_host = args.host.clone().unwrap_or(settings.host);
    let bind_port = args.port.unwrap_or(settings.port);

    let output = device::pick_device(&host, args.device.as_deref())?;
    let capacity = device::output_channel_capacity(&output)?;
    tracing::info!(device = %output.description()?, channels = capacity, "output device");

    let addrs = net::resolve(&bind_host, bind_port)?;
    let listeners = net::bind_all(&addrs)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        let _ = ctrlc::set_handler(move || shutdown.store(true, Ordering::Relaxed));
    }

    let backend = Rc::new(device::CpalBackend::new(output, capacity));
    let mut scheduler = Scheduler::new(shutdown);
    for listener in listeners {
        let session = net::session::ListenerSession::new(listener, backend.clone())?;
        scheduler.register(SessionEntry::new(Box::new(session), Readiness::READABLE));
    }
    scheduler.run();

    tracing::info!("all sessions drained, exiting");
    Ok(())
}
