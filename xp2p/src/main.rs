//! xp2p - Entry Point
//!
//! Bootstraps an encrypted tunnel between a server node and a client node.

use std::env;

use colored::Colorize;
use tracing::error;

use xp2p::cli::{self, client, parse_args, server};
use xp2p::utils::version_info;

const USAGE: &str = "usage: xp2p [--version] <server|client> <deploy|run> [--key=value ...]";

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let (commands, cli_args) = parse_args(env::args().skip(1));

    // Print version and exit
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(version) => println!("{version}"),
            Err(e) => eprintln!("Failed to render version: {e}"),
        }
        return;
    }

    let settings = match cli::load_settings().await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{} {}", "[ERROR]".red().bold(), e);
            std::process::exit(2);
        }
    };
    let _log_guard = cli::init(&settings, &cli_args);

    let words: Vec<&str> = commands.iter().map(String::as_str).collect();
    let result = match words.as_slice() {
        ["server", "deploy"] => server::deploy(&settings, &cli_args).await,
        ["server", "run"] => server::run(&settings, &cli_args).await,
        ["client", "deploy"] => client::deploy(&settings, &cli_args).await,
        ["client", "run"] => client::run(&settings, &cli_args).await,
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        error!("{} failed: {}", words.join(" "), e);
        eprintln!("\n{} {}", "[ERROR]".red().bold(), e);
        std::process::exit(1);
    }
}
