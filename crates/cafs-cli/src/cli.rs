use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "cafs",
    version,
    about = "Content-addressed object stores synced through OCI registries"
)]
pub struct CafsCli {
    #[arg(
        long,
        global = true,
        env = "CAFS_CACHE_DIR",
        help = "Root of blob and index storage (default: XDG data dir)"
    )]
    pub cache_dir: Option<PathBuf>,
    #[arg(short, long, action = ArgAction::Count, global = true, help = "Increase logging (-vv reaches trace)")]
    pub verbose: u8,
    #[arg(short, long, global = true, help = "Suppress status output")]
    pub quiet: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(about = "Pull a store's state from its registry to the local cache")]
    Pull {
        #[arg(value_name = "REF", help = "Reference, e.g. ttl.sh/org/cache:main")]
        reference: String,
    },
    #[command(about = "Push local state to the registry, optionally to extra tags")]
    Push {
        #[arg(value_name = "REF")]
        reference: String,
        #[arg(value_name = "TAG", help = "Additional tags to publish")]
        tags: Vec<String>,
    },
    #[command(about = "List entries, optionally under a key prefix")]
    List {
        #[arg(value_name = "REF")]
        reference: String,
        #[arg(value_name = "PREFIX")]
        prefix: Option<String>,
    },
    #[command(about = "Delete blobs no index entry references")]
    Gc {
        #[arg(value_name = "REF")]
        reference: String,
    },
    #[command(about = "Show entry and blob counters for a store")]
    Stats {
        #[arg(value_name = "REF")]
        reference: String,
    },
}
