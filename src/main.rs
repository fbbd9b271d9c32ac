use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;
use cratepak::ui;
use tracing::Level;

#[derive(Debug, Parser)]
#[command(about = "A deduplicating, encrypted backup tool")]
struct Args {
    /// Verbosity (-v, -vv, -vvv, etc.)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to the repository
    #[arg(short, long)]
    repository: Utf8PathBuf,

    #[command(subcommand)]
    subcommand: ui::Subcommand,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.verbose);

    let settings = cratepak::settings::load()?;
    ui::run(&args.repository, &settings, args.subcommand)
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}
