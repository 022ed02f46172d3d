use clap::Parser;
use cncjs_shuttle::api::JsonLinesTransport;
use cncjs_shuttle::app::Pendant;
use cncjs_shuttle::config::PendantConfig;
use cncjs_shuttle::model::InboundEvent;
use log::{error, info, trace, warn};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Jog pendant for Grbl machines driven through CNCJS.
///
/// Reads JSON events (one per line) on stdin and writes JSON commands on stdout.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// `-v` sets the level, a filter in the environment (`RUST_LOG`) overrides it.
fn logger(verbose: u8, env: env_logger::Env) -> env_logger::Builder {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).parse_env(env);
    builder
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    logger(args.verbose, env_logger::Env::default()).init();

    let config = match &args.config {
        Some(path) => match PendantConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        },
        None => PendantConfig::default(),
    };

    info!("Starting pendant");
    let pendant = Pendant::new(config);
    let (transport, writer) = JsonLinesTransport::spawn(tokio::io::stdout());
    pendant.attach(transport);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                trace!("> {}", line);
                match serde_json::from_str::<InboundEvent>(line) {
                    Ok(event) => pendant.on_event(event),
                    Err(e) => warn!("Ignoring input {:?}: {}", line, e),
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read input: {}", e);
                break;
            }
        }
    }
    info!("Input closed, exiting");

    // Last reference to the transport goes here, the writer then drains its queue
    pendant.detach();
    drop(pendant);
    if let Err(e) = writer.await {
        error!("Command writer failed: {}", e);
    }
}
