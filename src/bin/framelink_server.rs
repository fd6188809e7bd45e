use clap::Parser;
use framelink::{setup_tracing, AppResult, LinkConfig, ServerNode};
use std::path::PathBuf;
use tokio::runtime;

#[derive(Parser)]
#[command(version, about = "Accepts framed TCP connections and logs what they send")]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// override network.port
    #[arg(short, long)]
    pub port: Option<u16>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn log_directive(verbose: u8) -> &'static str {
    match verbose {
        0 | 1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("./conf.toml"), PathBuf::from);
    let mut config = LinkConfig::set_up_config(config_path)?;
    if let Some(port) = commandline.port {
        config.network.port = port;
    }

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.worker_threads)
        .thread_name("framelink-server")
        .enable_all()
        .build()?;

    let _tracing_guard = rt.block_on(setup_tracing(
        &config.log,
        log_directive(commandline.verbose),
    ))?;

    let node = ServerNode::new(config);
    node.start(&rt)?;

    Ok(())
}
