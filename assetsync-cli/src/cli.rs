use std::path::PathBuf;

use assetsync_engine::{InitReason, ProxyType};
use clap::{Args, Parser, Subcommand};

/// Define CLI arguments
#[derive(Parser)]
#[command(
    author = "hua0512 <https://github.com/hua0512>",
    version,
    about = "Versioned asset sync and integrity tool",
    long_about = "Keeps a versioned set of large binary assets present on disk and byte-exact.\n\
                  \n\
                  A manifest lists every asset of a version with its SHA-256. Missing assets are\n\
                  downloaded, everything is verified, and failed attempts are retried with\n\
                  exponential backoff, even across restarts."
)]
pub struct CliArgs {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args)]
pub struct GlobalArgs {
    /// Manifest URL template
    #[arg(
        long,
        short = 'u',
        global = true,
        help = "Manifest URL, '{version}' is replaced by the version tag (e.g. \"https://cdn.example.com/{version}/manifest.json\")"
    )]
    pub manifest_url: Option<String>,

    /// Asset set version to sync
    #[arg(long, short = 't', global = true, help = "Asset set version the host requires")]
    pub version_tag: Option<String>,

    /// Data directory holding the state and the blob cache
    #[arg(
        long,
        short = 'd',
        global = true,
        default_value = "./assets",
        help = "Directory for the persisted state and cached assets"
    )]
    pub data_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Show progress bars for operations
    #[arg(
        short = 'P',
        long = "progress",
        global = true,
        default_value = "false",
        help = "Show progress bars for asset downloads"
    )]
    pub show_progress: bool,

    /// Number of concurrent asset downloads
    #[arg(
        long,
        global = true,
        default_value = "2",
        help = "Maximum number of assets downloaded at the same time"
    )]
    pub concurrency: usize,

    /// Overall timeout in seconds
    #[arg(
        long,
        global = true,
        default_value = "0",
        help = "Overall timeout in seconds for HTTP requests"
    )]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[arg(
        long,
        global = true,
        default_value = "10",
        help = "Connection timeout in seconds (time to establish initial connection)"
    )]
    pub connect_timeout: u64,

    /// Read timeout in seconds
    #[arg(
        long,
        global = true,
        default_value = "30",
        help = "Read timeout in seconds (maximum time between receiving data chunks)"
    )]
    pub read_timeout: u64,

    /// Custom HTTP headers for download requests
    #[arg(
        long = "header",
        short = 'H',
        global = true,
        help = "Add custom HTTP header to requests (can be used multiple times). Format: 'Name: Value'",
        value_name = "HEADER"
    )]
    pub headers: Vec<String>,

    /// Proxy URL (e.g., "http://proxy.example.com:8080")
    #[arg(
        long,
        global = true,
        help = "Proxy server URL for downloads (e.g., \"http://proxy.example.com:8080\")"
    )]
    pub proxy: Option<String>,

    /// Proxy type
    #[arg(long, global = true, value_enum, default_value = "http", help = "Proxy type")]
    pub proxy_type: ProxyType,

    /// Proxy username
    #[arg(long, global = true, help = "Username for proxy authentication")]
    pub proxy_user: Option<String>,

    /// Proxy password
    #[arg(long, global = true, help = "Password for proxy authentication")]
    pub proxy_pass: Option<String>,

    /// Use system proxy settings for downloads
    #[arg(
        long,
        global = true,
        default_value = "true",
        help = "Use system proxy settings for downloads if no explicit proxy is configured"
    )]
    pub use_system_proxy: bool,

    /// Disable all proxy settings for downloads
    #[arg(
        long,
        global = true,
        help = "Disable all proxy settings (including system proxy) for downloads"
    )]
    pub no_proxy: bool,

    /// Retry attempts before giving up
    #[arg(
        long,
        global = true,
        default_value = "5",
        help = "Number of scheduled retries before a failure becomes terminal"
    )]
    pub max_attempts: u32,

    /// Base retry delay in seconds
    #[arg(
        long,
        global = true,
        default_value = "60",
        help = "Delay before the first retry in seconds, doubled on every further attempt"
    )]
    pub retry_delay: u64,

    /// Maximum age of a cached manifest fallback in hours
    #[arg(
        long,
        global = true,
        default_value = "168",
        help = "Maximum age in hours of a cached manifest used when the server is unreachable. Use 0 for unlimited."
    )]
    pub fallback_max_age: u64,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the lifecycle hook for a host event
    Init {
        #[arg(value_enum, help = "Host event that triggered the initialization")]
        reason: InitReason,
    },

    /// Make sure the target version is ready
    Sync,

    /// Print the persisted state as JSON
    Status,

    /// Read a verified asset of the ready version
    Get {
        #[arg(help = "Asset path as listed in the manifest")]
        path: String,

        #[arg(short, long, help = "Write the asset to this file instead of stdout")]
        output: Option<PathBuf>,
    },

    /// Remove the persisted state and every cached version
    Reset,

    /// Stay running and resume scheduled retries when they become due
    Watch {
        #[arg(
            long,
            default_value = "60",
            help = "Seconds between checks of the persisted retry schedule"
        )]
        interval: u64,
    },
}
