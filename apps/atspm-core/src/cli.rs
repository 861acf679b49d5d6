use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "atspm",
    version,
    about = "Aggregate hi-resolution signal controller events into performance measures"
)]
pub struct Args {
    /// Run configuration (JSON): processor settings, input paths and output layout.
    #[arg(long, short = 'c')]
    pub config: PathBuf,
    /// Engine worker threads; overrides the config file and ATSPM_THREADS.
    #[arg(long)]
    pub threads: Option<usize>,
    /// Write the per-step run report as JSON to this path.
    #[arg(long)]
    pub report: Option<PathBuf>,
    /// Exit non-zero when any aggregation step fails.
    #[arg(long, default_value_t = false)]
    pub strict: bool,
}
