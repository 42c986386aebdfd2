use clap::Parser;
use std::path::PathBuf;

/// Detects HLS variants, downloads a rendition and remuxes it to MP4.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// The M3U8 URL to download.
    #[arg(short, long)]
    pub url: String,

    /// Quality label to download (e.g. "720p"). Defaults to the highest bandwidth.
    #[arg(short, long)]
    pub quality: Option<String>,

    /// Keep only the audio track.
    #[arg(long)]
    pub audio_only: bool,

    /// Print the available quality variants and exit.
    #[arg(long)]
    pub list_variants: bool,

    /// Directory to save the finished file.
    #[arg(short, long, default_value = "output")]
    pub output_dir: PathBuf,

    /// HTTP request timeout in seconds.
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Give up on MP4 conversion if nothing is produced within this many seconds.
    #[arg(long, default_value_t = 5)]
    pub transmux_timeout_secs: u64,

    /// Minimum interval between progress updates, in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub progress_interval_ms: u64,

    /// Custom HTTP header(s). E.g., -H "Cookie: mycookie"
    #[arg(short = 'H', long = "header", action = clap::ArgAction::Append)]
    pub headers: Vec<String>,
}

pub fn parse_args() -> Args {
    Args::parse()
}
