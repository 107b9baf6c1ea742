#![deny(clippy::all, warnings)]

use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;

use cafs_core::{Options, Store};

mod cli;

use cli::{CafsCli, Command};

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = CafsCli::parse();
    init_tracing(cli.verbose);

    let mut options = Options::default();
    if let Some(dir) = &cli.cache_dir {
        options = options.with_cache_dir(dir.clone());
    }

    match &cli.command {
        Command::Pull { reference } => {
            let store = open(reference, options)?;
            status(&cli, &format!("Pulling {reference}..."));
            store.pull().map_err(|err| eyre!("pull failed: {err:#}"))?;
            close(&store)?;
            status(&cli, &format!("Done. Root: {}", store.root()));
        }
        Command::Push { reference, tags } => {
            let store = open(reference, options)?;
            status(&cli, &format!("Pushing {reference}..."));
            store
                .push(tags)
                .map_err(|err| eyre!("push failed: {err:#}"))?;
            close(&store)?;
            status(&cli, &format!("Done. Root: {}", store.root()));
        }
        Command::List { reference, prefix } => {
            let store = open(reference, options)?;
            let mut count = 0;
            for (key, info) in store.list(prefix.as_deref().unwrap_or("")) {
                println!("{key}\t{}", info.digest);
                count += 1;
            }
            if count == 0 {
                println!("(no entries)");
            }
            close(&store)?;
        }
        Command::Gc { reference } => {
            let store = open(reference, options)?;
            let removed = store.gc().map_err(|err| eyre!("gc failed: {err:#}"))?;
            close(&store)?;
            status(&cli, &format!("Removed {removed} unreferenced blobs"));
        }
        Command::Stats { reference } => {
            let store = open(reference, options)?;
            let stats = store.stats();
            println!("entries\t{}", stats.entries);
            println!("blobs\t{}", stats.blobs);
            println!("bytes\t{}", stats.total_size);
            close(&store)?;
        }
    }
    Ok(())
}

fn open(reference: &str, options: Options) -> Result<Store> {
    Store::open(reference, options).map_err(|err| eyre!("{err:#}"))
}

fn close(store: &Store) -> Result<()> {
    store.close().map_err(|err| eyre!("{err:#}"))
}

fn status(cli: &CafsCli, message: &str) {
    if !cli.quiet {
        eprintln!("{message}");
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = format!("cafs_core={level},cafs_cli={level}");
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
