// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use spa_server::{
    setup_tracing, AppResult, ClientHandle, MessageHandler, ServerConfig, SessionListener,
    SpaFrame, SpaServer,
};
use tokio::runtime;
use tracing::{debug, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    PrintConfig,
}

/// Writes every frame straight back to the terminal that sent it.
struct EchoHandler;

impl SessionListener for EchoHandler {
    fn on_connect(&self, client: &Arc<ClientHandle>) {
        info!(peer = %client.peer(), id = client.connection_id(), "terminal connected");
    }
    fn on_disconnect(&self, client: &Arc<ClientHandle>) {
        info!(peer = %client.peer(), id = client.connection_id(), "terminal disconnected");
    }
}

impl MessageHandler for EchoHandler {
    async fn handle(&self, frame: SpaFrame, client: Arc<ClientHandle>) -> AppResult<()> {
        debug!(peer = %client.peer(), len = frame.len(), "echo frame");
        client.send(frame.as_bytes()).await
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline: CommandLine = CommandLine::parse();

    let level = match commandline.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _tracing_guard = setup_tracing(&commandline.log_dir, level)?;

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = ServerConfig::load(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("spa-worker")
        .build()?;
    let server = SpaServer::new(config, EchoHandler);
    rt.block_on(server.run_until_ctrl_c())?;
    info!("server shutdown complete");
    Ok(())
}
