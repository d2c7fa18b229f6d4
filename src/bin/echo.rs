use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use tracing::{debug, info};

use eventide::{init_tracing, serve, Action, Conn, EventHandler, Options, ServerInfo, ServerResult};

#[derive(Parser)]
#[command(version, about = "eventide echo server")]
pub struct CommandLine {
    /// listen address, e.g. tcp://127.0.0.1:9000 or udp://127.0.0.1:9000
    #[arg(short, long, default_value = "tcp://127.0.0.1:9000")]
    pub addr: String,
    /// one event loop per core
    #[arg(short, long)]
    pub multicore: bool,
    /// run the heartbeat ticker
    #[arg(short, long)]
    pub ticker: bool,
    /// bind with SO_REUSEPORT
    #[arg(long)]
    pub reuse_port: bool,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

struct Echo;

impl EventHandler for Echo {
    fn on_init_complete(&self, server: &ServerInfo) -> Action {
        info!(addr = %server.addr, loops = server.num_loops, "echo server listening");
        Action::None
    }

    fn react(&self, conn: &mut Conn) -> (Option<Bytes>, Action) {
        let frame = conn.read();
        if frame.is_empty() {
            (None, Action::None)
        } else {
            (Some(frame), Action::None)
        }
    }

    fn tick(&self) -> (Duration, Action) {
        debug!("heartbeat");
        (Duration::from_secs(10), Action::None)
    }
}

fn main() -> ServerResult<()> {
    let commandline = CommandLine::parse();
    let default_directive = match commandline.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    init_tracing(default_directive);

    let options = Options {
        multicore: commandline.multicore,
        ticker: commandline.ticker,
        reuse_port: commandline.reuse_port,
        ..Options::default()
    };
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(Echo, &commandline.addr, options))
}
