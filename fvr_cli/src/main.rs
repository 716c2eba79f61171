mod forever;

use clap::Parser;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};
use std::path::PathBuf;
use tokio::runtime::Runtime;

use crate::forever::{load_config, run_command, Command};

#[derive(Parser)]
#[command(name = "forever")]
#[command(version, about = "Personal cloud-backed file store")]
struct Cli {
    /// Config file (default ~/.forever/forever.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let _ = TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("forever: {}", err);
            std::process::exit(1);
        }
    };
    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("forever: start runtime failed: {}", err);
            std::process::exit(1);
        }
    };

    match runtime.block_on(run_command(&config, cli.command)) {
        Ok(lines) => {
            for line in lines {
                println!("{}", line);
            }
        }
        Err(err) => {
            eprintln!("forever: {}", err);
            std::process::exit(1);
        }
    }
}
