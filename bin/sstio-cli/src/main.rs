//! SSTIO CLI - inspection of object directories
//!
//! Lists the objects of a provider directory, dumps the remote object catalog
//! and decodes shared object backings. Inspected directories are only read.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use sstio_catalog::{CATALOG_FILENAME, RemoteCatalog};
use sstio_common::{CleanupMethod, Locator, ProviderConfig};
use sstio_objstorage::{DirectoryScan, ObjectBacking, RemoteObjectBacking};
use sstio_remote::{LocalDirStorage, RemoteStorage, StorageFactory};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "sstio-cli")]
#[command(about = "SSTIO object directory inspection")]
#[command(version)]
struct Args {
    /// Provider configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the objects of a provider directory
    List {
        /// Provider directory
        #[arg(short, long)]
        dir: PathBuf,
        /// Directory backing remote storage; named locators use
        /// subdirectories of it
        #[arg(long)]
        remote_root: Option<PathBuf>,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Dump the remote object catalog of a provider directory
    Catalog {
        /// Provider directory
        #[arg(short, long)]
        dir: PathBuf,
    },
    /// Print the effective provider configuration
    Config,
    /// Decode a hex-encoded shared object backing
    DecodeBacking {
        /// Backing bytes as hex
        backing: String,
    },
}

/// Remote storage in local directories, one per locator
#[derive(Debug)]
struct DirStorageFactory {
    root: PathBuf,
}

impl StorageFactory for DirStorageFactory {
    fn create_storage(&self, locator: &Locator) -> sstio_common::Result<Arc<dyn RemoteStorage>> {
        let root = if locator.is_empty() {
            self.root.clone()
        } else {
            self.root.join(locator.as_str())
        };
        if !root.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("remote storage directory {} does not exist", root.display()),
            )
            .into());
        }
        debug!("Using {} for locator {:?}", root.display(), locator.as_str());
        Ok(Arc::new(LocalDirStorage::open(root)?))
    }
}

fn load_config(path: Option<&Path>) -> Result<ProviderConfig> {
    match path {
        Some(path) => ProviderConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(ProviderConfig::default()),
    }
}

fn cleanup_name(method: CleanupMethod) -> &'static str {
    match method {
        CleanupMethod::RefTracking => "ref-tracking",
        CleanupMethod::NoCleanup => "no-cleanup",
    }
}

fn list(dir: &Path, remote_root: Option<PathBuf>, as_json: bool) -> Result<()> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let factory = remote_root.map(|root| DirStorageFactory { root });
    let scan = DirectoryScan::read(dir, factory.as_ref().map(|f| f as &dyn StorageFactory))?;

    let objects = &scan.objects;
    if as_json {
        let entries: Vec<_> = objects
            .iter()
            .map(|meta| {
                let (backing, creator_id) = match &meta.backing {
                    ObjectBacking::Local => ("local", None),
                    ObjectBacking::Remote(r) if meta.is_shared() => ("shared", Some(r.creator_id.get())),
                    ObjectBacking::Remote(r) => ("external", Some(r.creator_id.get())),
                };
                json!({
                    "file_num": meta.file_num.get(),
                    "file_type": meta.file_type.to_string(),
                    "backing": backing,
                    "creator_id": creator_id,
                    "size": scan.size(meta).ok(),
                    "path": scan.path(meta),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        println!("Objects in {}", dir.display());
        println!("{}", "=".repeat(11 + dir.display().to_string().len()));
        for meta in objects {
            let backing = if !meta.is_remote() {
                "local"
            } else if meta.is_shared() {
                "shared"
            } else {
                "external"
            };
            let size = scan
                .size(meta)
                .map_or_else(|e| format!("? ({e})"), |s| s.to_string());
            println!(
                "{}  {:<5} {:<8} {:>12}  {}",
                meta.file_num,
                meta.file_type,
                backing,
                size,
                scan.path(meta)
            );
        }
        println!("{} objects", objects.len());
        if let Some(id) = scan.creator_id {
            println!("Creator ID: {id}");
        }
    }
    Ok(())
}

fn catalog(dir: &Path) -> Result<()> {
    let log = dir.join(CATALOG_FILENAME);
    if !log.exists() {
        bail!("no remote object catalog in {}", dir.display());
    }
    let contents = RemoteCatalog::read_contents(dir)?;
    let log_size = std::fs::metadata(&log)
        .with_context(|| format!("stat {}", log.display()))?
        .len();

    println!("Remote Object Catalog");
    println!("=====================");
    match contents.creator_id {
        Some(id) => println!("Creator ID: {id}"),
        None => println!("Creator ID: (not set)"),
    }
    println!("Log size: {log_size} bytes");
    println!("Objects: {}", contents.objects.len());
    for obj in &contents.objects {
        println!(
            "  {} {:<5} creator={} creator_file={} cleanup={} locator={:?}{}",
            obj.file_num,
            obj.file_type,
            obj.creator_id,
            obj.creator_file_num,
            cleanup_name(obj.cleanup_method),
            obj.locator.as_str(),
            obj.custom_object_name
                .as_ref()
                .map_or_else(String::new, |n| format!(" name={n}"))
        );
    }
    Ok(())
}

fn decode_backing(encoded: &str) -> Result<()> {
    let bytes = hex::decode(encoded.trim()).context("backing is not valid hex")?;
    let backing = RemoteObjectBacking::decode(&bytes)?;
    let out = json!({
        "creator_id": backing.creator_id.get(),
        "creator_file_num": backing.creator_file_num.get(),
        "cleanup_method": cleanup_name(backing.cleanup_method),
        "locator": backing.locator.as_str(),
        "custom_object_name": backing.custom_object_name,
        "ref_to_check": backing.ref_to_check.map(|(creator, file_num)| json!({
            "creator_id": creator.get(),
            "file_num": file_num.get(),
        })),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Commands::List {
            dir,
            remote_root,
            json,
        } => list(&dir, remote_root, json),
        Commands::Catalog { dir } => catalog(&dir),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::DecodeBacking { backing } => decode_backing(&backing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_inspection_leaves_directory_untouched() {
        let dir = tempdir().unwrap();
        let log = dir.path().join(CATALOG_FILENAME);
        let temp = dir.path().join(format!("{CATALOG_FILENAME}.tmp"));
        fs::write(dir.path().join("000001.sst"), b"table").unwrap();
        fs::write(&log, b"torn").unwrap();
        fs::write(&temp, b"stale").unwrap();
        let remote_root = dir.path().join("remote");

        list(dir.path(), Some(remote_root.clone()), true).unwrap();
        catalog(dir.path()).unwrap();

        assert_eq!(fs::read(&log).unwrap(), b"torn");
        assert!(temp.exists());
        assert!(!remote_root.exists());
    }

    #[test]
    fn test_missing_remote_root_not_created() {
        let dir = tempdir().unwrap();
        let factory = DirStorageFactory {
            root: dir.path().join("remote"),
        };
        assert!(factory.create_storage(&Locator::default()).is_err());
        assert!(!dir.path().join("remote").exists());
    }
}
