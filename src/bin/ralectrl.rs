//! `ralectrl`: a thin CLI client for the `raled` control socket.
//!
//! Talks directly to the Unix control socket. Subcommand surface covers
//! `status`/`list`/`add`/`remove`/`put`/`get`/`stop`.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(version, about = "Control client for the raled daemon", long_about = None)]
struct Cli {
    /// Path to the daemon's control socket.
    #[arg(long, default_value = "/tmp/raled.sock")]
    socket: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report this node's role, term, and cluster size.
    Status,
    /// List every node in the cluster membership table.
    List,
    /// Add a node to the cluster membership table.
    Add {
        node_id: i32,
        name: String,
        ip: String,
        rale_port: u16,
        dstore_port: u16,
    },
    /// Remove a node from the cluster membership table.
    Remove { node_id: i32 },
    /// Read a key's value.
    Get { key: String },
    /// Write a key's value (forwarded to the leader if needed).
    Put { key: String, value: String },
    /// Request a graceful daemon shutdown.
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_line = match &cli.command {
        Commands::Status => "STATUS".to_string(),
        Commands::List => "LIST".to_string(),
        Commands::Add {
            node_id,
            name,
            ip,
            rale_port,
            dstore_port,
        } => format!("ADD {node_id} {name} {ip} {rale_port} {dstore_port}"),
        Commands::Remove { node_id } => format!("REMOVE {node_id}"),
        Commands::Get { key } => format!("GET {key}"),
        Commands::Put { key, value } => format!("PUT {key} {value}"),
        Commands::Stop => "STOP".to_string(),
    };

    let stream = UnixStream::connect(&cli.socket).await?;
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(command_line.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    write_half.flush().await?;

    let mut reader = BufReader::new(read_half);
    let mut response = String::new();
    reader.read_line(&mut response).await?;
    print!("{response}");
    if !response.ends_with('\n') {
        println!();
    }

    Ok(())
}
