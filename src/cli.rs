use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::StorageConfig;

#[derive(Parser, Debug)]
#[command(name = "wacz-stream")]
#[command(version)]
#[command(about = "Read, merge, bundle and upload WACZ archives in object storage", long_about = None)]
#[command(after_help = "Examples:\n  \
  wacz-stream ls -l crawl-1.wacz                   list entries with sizes\n  \
  wacz-stream cat crawl-1.wacz pages/pages.jsonl   stream one entry\n  \
  wacz-stream logs a.wacz b.wacz --level error     merged error logs as NDJSON\n  \
  wacz-stream bundle a.wacz b.wacz > all.zip       multi-WACZ download package")]
pub struct Cli {
    #[command(flatten)]
    pub storage: StorageArgs,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Where the archives live. Keys given to subcommands are relative to the
/// prefix in the endpoint URL.
#[derive(Args, Debug, Clone)]
pub struct StorageArgs {
    /// Endpoint URL with bucket and optional prefix, e.g. https://s3.example.com/crawls/org-1/
    #[arg(long, env = "WACZ_STORE_ENDPOINT", global = true)]
    pub endpoint: Option<String>,

    #[arg(long, env = "WACZ_STORE_ACCESS_KEY", hide_env_values = true, global = true)]
    pub access_key: Option<String>,

    #[arg(long, env = "WACZ_STORE_SECRET_KEY", hide_env_values = true, global = true)]
    pub secret_key: Option<String>,

    #[arg(long, env = "WACZ_STORE_REGION", global = true)]
    pub region: Option<String>,

    /// Public endpoint to put in presigned links
    #[arg(long, env = "WACZ_STORE_ACCESS_ENDPOINT", global = true)]
    pub access_endpoint: Option<String>,

    /// Sign links with a client on the access endpoint instead of rewriting
    #[arg(long, global = true, requires = "access_endpoint")]
    pub presign_via_access: bool,

    /// Use plain HTTP against a public bucket (read-only commands)
    #[arg(long, global = true)]
    pub anonymous: bool,
}

impl StorageArgs {
    pub fn config(&self) -> Option<StorageConfig> {
        let endpoint = self.endpoint.clone()?;
        let mut config = StorageConfig::new(endpoint);
        config.access_key = self.access_key.clone();
        config.secret_key = self.secret_key.clone();
        config.region = self.region.clone();
        if let Some(access) = &self.access_endpoint {
            config.access_endpoint_url = Some(access.clone());
            config.use_access_for_presign = self.presign_via_access;
        }
        Some(config)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the entries of an archive
    Ls {
        key: String,
        /// Table with sizes, compression ratio and dates
        #[arg(short = 'l', long)]
        long: bool,
    },

    /// Write one entry of an archive to stdout
    Cat { key: String, entry: String },

    /// Merge the logs of several archives into NDJSON on stdout
    Logs {
        #[arg(required = true, num_args = 1..)]
        keys: Vec<String>,

        /// Keep only these log levels
        #[arg(long = "level", value_name = "LEVEL")]
        levels: Vec<String>,

        /// Keep only these contexts
        #[arg(long = "context", value_name = "CONTEXT")]
        contexts: Vec<String>,

        /// Read these entries instead of everything under logs/
        #[arg(long = "entry", value_name = "NAME")]
        entries: Vec<String>,
    },

    /// Package whole archives into one zip with a datapackage.json manifest
    Bundle {
        #[arg(required = true, num_args = 1..)]
        keys: Vec<String>,

        /// Upload the package to this key instead of writing stdout
        #[arg(short = 'o', long, value_name = "KEY")]
        output: Option<String>,

        /// Multipart part size in bytes
        #[arg(long, value_name = "BYTES")]
        part_size: Option<usize>,
    },

    /// Multipart upload of a file (or stdin) to a key
    Upload {
        key: String,

        /// Read from this file instead of stdin
        #[arg(short = 'f', long, value_name = "PATH")]
        file: Option<PathBuf>,

        /// Multipart part size in bytes
        #[arg(long, value_name = "BYTES")]
        part_size: Option<usize>,
    },

    /// Print a presigned GET URL
    Presign {
        key: String,

        /// Validity in seconds
        #[arg(long, default_value_t = 3600)]
        expires: u64,
    },

    /// Check that the credentials can write to the storage
    Verify,

    /// Delete an object
    Rm { key: String },
}

impl Command {
    /// Whether the command only reads from the store.
    pub fn is_read_only(&self) -> bool {
        match self {
            Command::Ls { .. } | Command::Cat { .. } | Command::Logs { .. } => true,
            Command::Bundle { output, .. } => output.is_none(),
            _ => false,
        }
    }
}
