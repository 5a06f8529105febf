use clap::Parser;
mod channel;
mod cli;
mod config;
mod error;
mod jobs;
mod listing;
mod logging;
mod mount;
mod overlay;
mod patch;
mod process;
#[cfg(test)]
mod testing;
mod util;

fn main() {
    let cli = cli::Cli::parse();
    logging::init_tracing(logging::LogConfig::new(cli.verbose));

    if let Err(e) = cli.run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
