use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use poolmon::commands::{self, AddRequest, SystemRunner};
use poolmon::{monitor, SETUP_SYSCONFIG};
use std::path::Path;

#[derive(Parser, Debug)]
#[command(name = "poolmon", about = "Container storage pool monitor and device manager", version = "0.1")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch the storage pool and print a JSON line on every state change
    Monitor,
    /// Stop the storage service, reset the pool, drop and wipe unused PVs, restart
    ResetAndReduce,
    /// Wipe devices and add them to the pool; takes a JSON request object
    Add {
        /// e.g. {"devs": ["/dev/sdb"], "vgroup": "docker-vg", "reset": false}
        request: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Monitor => monitor::run(),
        Commands::ResetAndReduce => {
            commands::reset_and_reduce(&mut SystemRunner, Path::new(SETUP_SYSCONFIG))
        }
        Commands::Add { request } => {
            let req: AddRequest =
                serde_json::from_str(&request).context("invalid add request")?;
            commands::add(&mut SystemRunner, Path::new(SETUP_SYSCONFIG), &req)
        }
    }
}
