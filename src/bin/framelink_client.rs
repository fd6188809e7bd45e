use clap::Parser;
use framelink::{setup_tracing, AppResult, ClientNode, LinkConfig};
use std::path::PathBuf;
use tokio::runtime;

#[derive(Parser)]
#[command(version, about = "Sends stdin lines as frames, reconnecting while the server is down")]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// override client.server_ip
    #[arg(long)]
    pub server_ip: Option<String>,
    /// override client.server_port
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

fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("./conf.toml"), PathBuf::from);
    let mut config = LinkConfig::set_up_config(config_path)?;
    if let Some(server_ip) = commandline.server_ip {
        config.client.server_ip = server_ip;
    }
    if let Some(port) = commandline.port {
        config.client.server_port = port;
    }

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.worker_threads)
        .thread_name("framelink-client")
        .enable_all()
        .build()?;

    let directive = match commandline.verbose {
        0 | 1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _tracing_guard = rt.block_on(setup_tracing(&config.log, directive))?;

    let node = ClientNode::new(config);
    node.start(&rt)?;

    Ok(())
}
