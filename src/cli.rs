use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{config::Config, device::DeviceMapping, server};

/// The command line interface for slotline.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, default_value_t = server::DEFAULT_PORT)]
    pub port: u16,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example of a device mapping document.
    Mapping,

    /// Show an example slot mapping edit request.
    SlotMapping,
}

/// Print whatever the given command asks for.
pub fn handle_command(command: Commands) {
    let Commands::Examples(example) = command;

    match example {
        Examples::Config => println!("{}", Config::example().serialize_pretty()),
        Examples::Mapping => println!(
            "{}",
            serde_json::to_string_pretty(&DeviceMapping::example())
                .expect("The example serializes")
        ),
        Examples::SlotMapping => println!(
            r#"{{ "slots": {{ "5": "1:2", "6": ["1:3", "1:4:9600"] }} }}"#
        ),
    }
}
