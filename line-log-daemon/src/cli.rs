use clap::Parser;

/// Appends newline-delimited records from TCP clients to a shared log and
/// replays the whole log after every record.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Detach from the controlling terminal once the port is bound.
    #[arg(short, long)]
    pub daemon: bool,
}
