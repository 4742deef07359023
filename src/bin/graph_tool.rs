use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use graphpersist::storage::PersistentMap;
use graphpersist::store::MANIFEST_KEY;
use graphpersist::{Puuid, ReferenceIndex, StorableRecord, StoreConfig, references_of};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "graph-tool")]
#[command(about = "Inspect and maintain a graphpersist store directory")]
struct Cli {
    /// Store directory holding the snapshot and journal.
    #[arg(long)]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List stored record ids.
    Keys {
        /// Include reserved keys such as the collection manifest.
        #[arg(long)]
        all: bool,
    },
    /// Print one record as JSON.
    Show { id: String },
    /// Ids the record points at.
    Refs { id: String },
    /// Ids of records pointing at the record.
    Referrers { id: String },
    /// Print the collection manifest.
    Collections,
    /// Fold the journal into a fresh snapshot.
    Compact,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let map = open_map(&cli.dir).await?;

    match cli.command {
        Command::Keys { all } => {
            for key in map.all_keys().await? {
                if all || !key.starts_with('$') {
                    println!("{}", key);
                }
            }
            Ok(())
        }
        Command::Show { id } => {
            let record = read_record(&map, &id).await?;
            let rendered = serde_json::to_string_pretty(&record.to_json()?)
                .context("Failed to render record")?;
            println!("{}", rendered);
            Ok(())
        }
        Command::Refs { id } => {
            let record = read_record(&map, &id).await?;
            for target in references_of(&record) {
                println!("{}", target);
            }
            Ok(())
        }
        Command::Referrers { id } => {
            let id = Puuid::parse(&id)?;
            let index = ReferenceIndex::new();
            for key in map.all_keys().await? {
                if key.starts_with('$') {
                    continue;
                }
                let record = read_record(&map, &key).await?;
                index.record_written(&record)?;
            }
            for referrer in index.referenced_by(&id)? {
                println!("{}", referrer);
            }
            Ok(())
        }
        Command::Collections => {
            match map.get(MANIFEST_KEY).await? {
                Some(manifest) => println!(
                    "{}",
                    serde_json::to_string_pretty(&manifest).context("Failed to render manifest")?
                ),
                None => println!("(no collections)"),
            }
            Ok(())
        }
        Command::Compact => {
            let keys = map.len().await?;
            map.close()
                .await
                .with_context(|| format!("Failed to compact store in '{}'", cli.dir.display()))?;
            println!("Compacted {} keys in {}", keys, cli.dir.display());
            Ok(())
        }
    }
}

async fn open_map(dir: &Path) -> Result<PersistentMap> {
    if !dir.is_dir() {
        return Err(anyhow!("Store directory '{}' does not exist", dir.display()));
    }
    let map = PersistentMap::from_config(&StoreConfig::on_disk(dir));
    map.open()
        .await
        .with_context(|| format!("Failed to open store in '{}'", dir.display()))?;
    Ok(map)
}

async fn read_record(map: &PersistentMap, id: &str) -> Result<StorableRecord> {
    let stored = map
        .get(id)
        .await?
        .ok_or_else(|| anyhow!("No record stored under '{}'", id))?;
    StorableRecord::from_json(stored).with_context(|| format!("Record '{}' is malformed", id))
}
