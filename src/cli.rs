use std::path::PathBuf;

use clap::Parser;

/// Receive audio streams over TCP and play them on a local output device.
#[derive(Parser, Debug)]
#[command(name = "audio-relay", version)]
pub(crate) struct Args {
    /// List output devices and exit
    #[arg(long)]
    pub(crate) list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub(crate) device: Option<String>,

    /// Settings file path (created with defaults if missing)
    #[arg(long, default_value = "settings.json")]
    pub(crate) config: PathBuf,

    /// Override the bind host from the settings file
    #[arg(long)]
    pub(crate) host: Option<String>,

    /// Override the bind port from the settings file
    #[arg(long)]
    pub(crate) port: Option<u16>,
}
