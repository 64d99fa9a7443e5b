use clap::Parser;
use lobby_server::bans::BanRegistry;
use lobby_server::server::{BoxError, LobbyServer, ServerConfig};
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;

/// Command-line arguments covering the lobby's whole configuration
/// surface: listening socket, lobby identity, directory server, ban list.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Address to bind the listening socket to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Port to listen on
    #[clap(short, long, default_value = "5255")]
    port: u16,
    /// Lobby name advertised to clients and the directory server
    #[clap(short, long, default_value = "Unnamed lobby")]
    name: String,
    /// Maximum number of players allowed in the lobby
    #[clap(short, long, default_value = "20")]
    max_players: u32,
    /// Directory server host to register with
    #[clap(long, default_value = "localhost")]
    directory_host: String,
    /// Directory server port
    #[clap(long, default_value = "5254")]
    directory_port: u16,
    /// Skip directory registration entirely
    #[clap(long)]
    no_directory: bool,
    /// JSON file with ban entries: [{"ip": "...", "unique_id": [...]}]
    #[clap(long)]
    ban_list: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();

    let bans = match &args.ban_list {
        Some(path) => BanRegistry::load(path)?,
        None => BanRegistry::default(),
    };

    let directory_addr = if args.no_directory {
        None
    } else {
        Some(format!("{}:{}", args.directory_host, args.directory_port))
    };

    let server = LobbyServer::new(
        ServerConfig {
            bind_addr: format!("{}:{}", args.host, args.port),
            lobby_name: args.name,
            max_players: args.max_players,
            directory_addr,
        },
        bans,
    )
    .await?;

    let mut run_handle = tokio::spawn(Arc::clone(&server).run());

    tokio::select! {
        result = &mut run_handle => {
            return match result {
                Ok(inner) => inner,
                Err(e) => {
                    error!("server task panicked: {}", e);
                    Err(Box::new(e) as BoxError)
                }
            };
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down gracefully");
            server.close();
        }
    }

    match run_handle.await {
        Ok(inner) => inner,
        Err(e) => {
            error!("server task panicked: {}", e);
            Err(Box::new(e) as BoxError)
        }
    }
}
