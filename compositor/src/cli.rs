use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "compositor", version, about = "Composite topology controller CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the controller with config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Declare or update a composite from a resource YAML file
    Apply {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Remove a composite resource (its registered structure is left in place)
    Delete {
        #[arg(short, long)]
        config: PathBuf,
        name: String,
    },
}
