use std::path::PathBuf;

use clap::{Parser, Subcommand};

use inapp_engine::inapp::persistence::encode_document;
use inapp_engine::{init_tracing, FilePersister, InAppError, Persister, SqlitePersister};

/// Inspect or clear a persisted in-app message store
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// JSON document store
    #[clap(long, value_name = "PATH", conflicts_with = "sqlite", required_unless_present = "sqlite")]
    file: Option<PathBuf>,

    /// SQLite store
    #[clap(long, value_name = "PATH")]
    sqlite: Option<PathBuf>,

    /// Directory for logs, nothing is logged when omitted
    #[clap(long, value_name = "PATH")]
    logs_dir: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the stored messages as a versioned JSON document
    Dump,
    /// Print one line per stored message
    List,
    /// Delete every stored message
    Clear,
}

async fn open_store(args: &Args) -> Result<Box<dyn Persister>, InAppError> {
    match (&args.file, &args.sqlite) {
        (Some(path), _) => Ok(Box::new(FilePersister::new(path.clone()))),
        (None, Some(path)) => Ok(Box::new(SqlitePersister::new(path.clone()).await?)),
        (None, None) => Err(anyhow::anyhow!("either --file or --sqlite is required").into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), InAppError> {
    let args = Args::parse();

    if let Some(logs_dir) = &args.logs_dir {
        std::fs::create_dir_all(logs_dir)?;
        init_tracing(logs_dir);
    }

    let store = open_store(&args).await?;

    match args.command {
        Command::Dump => {
            let messages = store.load().await;
            println!("{}", serde_json::to_string_pretty(&encode_document(&messages))?);
        }
        Command::List => {
            let messages = store.load().await;
            for message in &messages {
                println!(
                    "{}\ttrigger={}\tpriority={}\tinbox={}\tread={}\tprocessed={}\tconsumed={}",
                    message.id,
                    message.trigger.trigger_type,
                    message.priority_level,
                    message.save_to_inbox,
                    message.read,
                    message.did_process_trigger,
                    message.consumed
                );
            }
            tracing::info!(
                target: "inapp_store::list",
                "Listed {} stored messages",
                messages.len()
            );
        }
        Command::Clear => {
            store.clear().await?;
            tracing::info!(target: "inapp_store::clear", "Cleared message store");
            println!("Cleared");
        }
    }

    Ok(())
}
