//! blobctl - operate a mail blob store from the command line
//!
//! Stores and reads message blobs through the configured backend and runs
//! the hard-link deduper over local message volumes.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use blobstore::{
    BackendConfig, BlobCatalog, BlobDeduper, ContentDigest, DedupOutcome, DedupStart, Mailbox,
    SqliteBlobCatalog, StoreConfig, StoreManager, VolumeId, open_store_manager,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{info, warn};

#[derive(Parser)]
#[command(name = "blobctl")]
#[command(about = "Mail blob store maintenance")]
struct Cli {
    /// Store config file (defaults to blobstore.json in the config directory)
    #[arg(short, long, env = "BLOBSTORE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config to the config directory
    Init,
    /// List volumes and their dedupe cursors
    Volumes,
    /// Store a message file for a mailbox item
    Put {
        file: PathBuf,
        #[arg(long)]
        mailbox: i32,
        #[arg(long, default_value = "")]
        account: String,
        #[arg(long)]
        item: i32,
        #[arg(long, default_value_t = 1)]
        revision: i32,
    },
    /// Write a stored item's content to stdout
    Get {
        #[arg(long)]
        mailbox: i32,
        #[arg(long)]
        item: i32,
        #[arg(long, default_value_t = 1)]
        revision: i32,
        #[arg(long)]
        locator: String,
    },
    /// Store a file, read it back, compare, and delete it
    Roundtrip { file: PathBuf },
    /// Hard-link identical blobs on message volumes
    Dedupe {
        /// Volume to process; repeat for several (default: every message volume)
        #[arg(short, long = "volume")]
        volumes: Vec<VolumeId>,
    },
    /// Forget dedupe progress so the next run rescans
    Reset {
        #[arg(short, long = "volume")]
        volumes: Vec<VolumeId>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => StoreConfig::from_file(path)?,
        None => StoreConfig::load()?,
    };

    match cli.command {
        Command::Init => {
            config::init()?;
            let path = config.save()?;
            println!("Wrote {}", path.display());
        }
        Command::Volumes => {
            let catalog = open_catalog(&config)?;
            for volume in catalog.volumes()? {
                let marker = if volume.id == config.current_volume { "*" } else { " " };
                println!(
                    "{} {:>3} {:<14} {} (last scan {}, resume group {})",
                    marker,
                    volume.id,
                    volume.kind.as_str(),
                    volume.root.display(),
                    volume.metadata.last_sync_date,
                    volume.metadata.group_id
                );
            }
        }
        Command::Put {
            file,
            mailbox,
            account,
            item,
            revision,
        } => {
            let sm = open_store_manager(&config)?;
            let mbox = Mailbox::new(mailbox, account);
            let mut input =
                File::open(&file).with_context(|| format!("Failed to open {}", file.display()))?;
            let size = input.metadata().map(|m| m.len()).ok();
            let staged = sm.stage_stream(&mut input, size, &mbox)?;
            let mblob = sm.rename_to(&staged, &mbox, item, revision)?;

            if config.backend == BackendConfig::File {
                let catalog = open_catalog(&config)?;
                catalog.upsert_mailbox(&mbox)?;
                let created = Utc::now().timestamp();
                catalog.record_item_blob(&mblob.info(), config.current_volume, created)?;
            }
            println!("{} {} {}", mblob.locator(), staged.digest(), staged.size());
        }
        Command::Get {
            mailbox,
            item,
            revision,
            locator,
        } => {
            let sm = open_store_manager(&config)?;
            let mbox = Mailbox::new(mailbox, "");
            let mblob = sm
                .get_mailbox_blob(&mbox, item, revision, &locator, true)?
                .ok_or_else(|| anyhow!("no content for item {} at {}", item, locator))?;
            io::copy(&mut sm.content(&mblob)?, &mut io::stdout().lock())?;
        }
        Command::Roundtrip { file } => {
            let sm = open_store_manager(&config)?;
            roundtrip(sm.as_ref(), &file)?;
        }
        Command::Dedupe { volumes } => {
            let catalog = open_catalog(&config)?;
            let volumes = if volumes.is_empty() {
                catalog
                    .volumes()?
                    .into_iter()
                    .filter(|v| v.kind.holds_blobs())
                    .map(|v| v.id)
                    .collect()
            } else {
                volumes
            };
            let deduper = Arc::new(BlobDeduper::with_default_links(catalog));
            let handle = match deduper.process(volumes)? {
                DedupStart::Started(handle) => handle,
                DedupStart::AlreadyRunning => bail!("a dedupe is already running"),
            };
            while !handle.is_finished() {
                std::thread::sleep(Duration::from_secs(2));
                for (id, progress) in deduper.blob_digests_progress() {
                    info!("[DEDUPE] Volume {} digests {}", id, progress);
                }
            }
            let outcome = handle
                .join()
                .map_err(|_| anyhow!("deduper thread panicked"))?;
            let (links, size) = deduper.count_and_size();
            println!("{:?}: {} links created, {} bytes saved", outcome, links, size);
            if outcome == DedupOutcome::Cancelled {
                warn!("Dedupe stopped early; run again to resume");
            }
        }
        Command::Reset { volumes } => {
            let catalog = open_catalog(&config)?;
            let deduper = BlobDeduper::with_default_links(catalog);
            match deduper.reset_volume_blobs(&volumes)? {
                DedupOutcome::Completed => println!("Reset done"),
                other => bail!("reset did not run: {:?}", other),
            }
        }
    }
    Ok(())
}

/// Open the catalog and make sure it knows the configured volumes
fn open_catalog(config: &StoreConfig) -> Result<Arc<SqliteBlobCatalog>> {
    let catalog = SqliteBlobCatalog::new(&config.catalog_path)?;
    for volume in config.effective_volumes() {
        catalog.upsert_volume(&volume)?;
    }
    Ok(Arc::new(catalog))
}

fn roundtrip(sm: &dyn StoreManager, file: &Path) -> Result<()> {
    let mut original = Vec::new();
    File::open(file)
        .with_context(|| format!("Failed to open {}", file.display()))?
        .read_to_end(&mut original)?;
    let mbox = Mailbox::new(1, "blobctl");

    let blob = sm.store_incoming(&mut original.as_slice(), false)?;
    let staged = sm.stage(&blob, &mbox)?;
    let mblob = sm.link(&staged, &mbox, 1, 1)?;

    let mut read_back = Vec::new();
    sm.content(&mblob)?.read_to_end(&mut read_back)?;
    let ok = read_back == original;

    sm.delete_mailbox_blob(&mblob)?;
    sm.delete_blob(&blob)?;

    let digest = ContentDigest::of(&original).to_base64url();
    if !ok {
        bail!(
            "content read back from {} differs ({} bytes stored)",
            mblob.locator(),
            read_back.len()
        );
    }
    println!("ok {} {} bytes digest {}", mblob.locator(), original.len(), digest);
    Ok(())
}
