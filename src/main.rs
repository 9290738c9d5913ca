//! Main entry point for the wacz-stream CLI application.
//!
//! Every subcommand works directly against object storage: archives are
//! read with range requests and packages are streamed, never staged on
//! local disk.

use anyhow::{Context, Result, bail};
use bytes::{Bytes, BytesMut};
use clap::Parser;
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wacz_stream::cli::{Cli, Command};
use wacz_stream::config::{CHUNK_SIZE, StorageConfig};
use wacz_stream::io::{ByteStream, HttpObjectStore, ObjectStore, S3ObjectStore};
use wacz_stream::logs::{LogFilter, LogSource, merge_filtered_logs};
use wacz_stream::package::{PackageFile, package_download};
use wacz_stream::upload::{MultipartUploader, verify_storage_upload};
use wacz_stream::zip::{ZipEntryMeta, ZipExtractor};

/// Records buffered between the merge task and stdout.
const LOG_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    // reqwest and the AWS SDK both build rustls configs
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = cli
        .storage
        .config()
        .context("an endpoint is required (--endpoint or WACZ_STORE_ENDPOINT)")?;

    if cli.storage.anonymous {
        if !cli.command.is_read_only() && !matches!(cli.command, Command::Rm { .. } | Command::Verify) {
            bail!("this command needs S3 credentials and cannot run with --anonymous");
        }
        let http = Arc::new(HttpObjectStore::new()?);
        run(&cli, &config, http.clone(), None).await?;
        info!("total bytes transferred: {}", format_size(http.transferred_bytes()));
    } else {
        let s3 = Arc::new(S3ObjectStore::connect(&config).await?);
        run(&cli, &config, s3.clone(), Some(s3)).await?;
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,wacz_stream={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Dispatch one subcommand. `s3` is only present with credentials.
async fn run(
    cli: &Cli,
    config: &StorageConfig,
    store: Arc<dyn ObjectStore>,
    s3: Option<Arc<S3ObjectStore>>,
) -> Result<()> {
    let require_s3 = || s3.clone().context("S3 credentials are required for this command");

    match &cli.command {
        Command::Ls { key, long } => {
            let extractor = ZipExtractor::new(store);
            let entries = extractor.list_entries(&config.object(key)?).await?;
            list_entries(&entries, *long);
        }
        Command::Cat { key, entry } => {
            let extractor = ZipExtractor::new(store);
            let mut stdout = tokio::io::stdout();
            let written = extractor
                .extract_to_writer(&config.object(key)?, entry, &mut stdout)
                .await?;
            info!(entry = %entry, bytes = written, "entry written");
        }
        Command::Logs {
            keys,
            levels,
            contexts,
            entries,
        } => {
            let sources = keys
                .iter()
                .map(|key| {
                    let object = config.object(key)?;
                    Ok(if entries.is_empty() {
                        LogSource::new(object)
                    } else {
                        LogSource::with_entries(object, entries.iter().cloned())
                    })
                })
                .collect::<wacz_stream::Result<Vec<_>>>()?;
            let filter = LogFilter::new(levels.iter().cloned(), contexts.iter().cloned());

            let merger = merge_filtered_logs(store, &sources, filter).await?;
            let stats = merger.stats();
            let records = merger.spawn(LOG_CHANNEL_CAPACITY).map(|item| {
                item.and_then(|record| Ok(Bytes::from(record.to_json_line()?)))
            });
            copy_stream(records.boxed(), &mut tokio::io::stdout()).await?;

            if stats.dropped_lines() > 0 {
                warn!(dropped = stats.dropped_lines(), "some log lines could not be parsed");
            }
            info!(
                emitted = stats.emitted_records(),
                filtered = stats.filtered_records(),
                "log merge finished"
            );
        }
        Command::Bundle {
            keys,
            output,
            part_size,
        } => {
            let files = keys
                .iter()
                .map(|key| Ok(PackageFile::new(config.object(key)?)))
                .collect::<wacz_stream::Result<Vec<_>>>()?;
            let package = package_download(store, files);

            match output {
                Some(target) => {
                    let uploader = uploader(require_s3()?, *part_size)?;
                    let done = uploader.upload(&config.object(target)?, package).await?;
                    println!("{} ({}, {} parts)", done.object, format_size(done.size), done.parts.len());
                }
                None => {
                    let written = copy_stream(package, &mut tokio::io::stdout()).await?;
                    info!(bytes = written, "package written");
                }
            }
        }
        Command::Upload {
            key,
            file,
            part_size,
        } => {
            let uploader = uploader(require_s3()?, *part_size)?;
            let input = match file {
                Some(path) => {
                    let file = tokio::fs::File::open(path)
                        .await
                        .with_context(|| format!("cannot open {}", path.display()))?;
                    reader_stream(file)
                }
                None => reader_stream(tokio::io::stdin()),
            };
            let done = uploader.upload(&config.object(key)?, input).await?;
            println!("{} ({}, {} parts)", done.object, format_size(done.size), done.parts.len());
        }
        Command::Presign { key, expires } => {
            let s3 = require_s3()?;
            let url = s3
                .presign_get(&config.object(key)?, Duration::from_secs(*expires))
                .await?;
            println!("{url}");
        }
        Command::Verify => {
            let marker = verify_storage_upload(store.as_ref(), &config.location()?).await?;
            println!("ok: wrote {marker}");
        }
        Command::Rm { key } => {
            let object = config.object(key)?;
            store.delete_object(&object).await?;
            println!("deleted {object}");
        }
    }
    Ok(())
}

fn uploader(s3: Arc<S3ObjectStore>, part_size: Option<usize>) -> Result<MultipartUploader<S3ObjectStore>> {
    let uploader = MultipartUploader::new(s3);
    Ok(match part_size {
        Some(size) => uploader.with_part_size(size)?,
        None => uploader,
    })
}

/// Chunked byte stream over an async reader.
fn reader_stream<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    futures::stream::try_unfold(reader, |mut reader| async move {
        let chunk = read_chunk(&mut reader).await?;
        Ok::<_, wacz_stream::Error>(chunk.map(|chunk| (chunk, reader)))
    })
    .boxed()
}

async fn read_chunk<R>(reader: &mut R) -> wacz_stream::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
    if reader.read_buf(&mut buf).await? == 0 {
        return Ok(None);
    }
    Ok(Some(buf.freeze()))
}

async fn copy_stream<W>(mut stream: ByteStream, writer: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    while let Some(chunk) = stream.try_next().await? {
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    writer.flush().await?;
    Ok(written)
}

/// Print archive entries, either names only or as a table with totals.
fn list_entries(entries: &[ZipEntryMeta], long: bool) {
    if long {
        println!(
            "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  Name",
            "Length", "Size", "Cmpr", "Date", "Time"
        );
        println!("{}", "-".repeat(70));
    }

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for entry in entries {
        if !long {
            println!("{}", entry.name);
            continue;
        }

        let (year, month, day) = entry.mod_date();
        let (hour, minute, _second) = entry.mod_time();
        println!(
            "{:>10}  {:>10}  {}  {:04}-{:02}-{:02}  {:02}:{:02}  {}",
            entry.uncompressed_size,
            entry.compressed_size,
            ratio(entry.compressed_size, entry.uncompressed_size),
            year,
            month,
            day,
            hour,
            minute,
            entry.name
        );

        if !entry.is_directory {
            total_uncompressed += entry.uncompressed_size;
            total_compressed += entry.compressed_size;
            file_count += 1;
        }
    }

    if long {
        println!("{}", "-".repeat(70));
        println!(
            "{:>10}  {:>10}  {}  {:>21}  {} files",
            total_uncompressed,
            total_compressed,
            ratio(total_compressed, total_uncompressed),
            "",
            file_count
        );
    }
}

/// Space saved by compression, as a right-aligned percentage.
fn ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed > 0 && compressed <= uncompressed {
        format!("{:>4}%", 100 - (compressed * 100 / uncompressed))
    } else {
        "  0%".to_string()
    }
}

/// Format a byte size into a human-readable string.
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
