//! CLI arguments and server configuration defaults.

use clap::Parser;

pub const MIB: u64 = 1024 * 1024;

// Chunk planning tiers. Small files get many small chunks so parallelism can
// help; huge files get few large chunks to keep request count down.
pub const SMALL_FILE_LIMIT: u64 = 500 * MIB;
pub const MEDIUM_FILE_LIMIT: u64 = 5 * 1024 * MIB;
pub const SMALL_TARGET_CHUNKS: u64 = 20;
pub const MEDIUM_TARGET_CHUNKS: u64 = 40;
pub const LARGE_TARGET_CHUNKS: u64 = 60;
pub const SMALL_MIN_CHUNK_SIZE: u64 = 10 * MIB;
pub const MEDIUM_MIN_CHUNK_SIZE: u64 = 25 * MIB;
pub const LARGE_MIN_CHUNK_SIZE: u64 = 50 * MIB;
pub const MAX_CHUNK_SIZE: u64 = 100 * MIB;
pub const MIN_CHUNK_SIZE: u64 = MIB;

// Slack allowed between declared and observed byte counts. Absorbs transport
// framing differences without letting a truncated write through.
pub const SIZE_TOLERANCE: u64 = 1024;

pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "mov", "m4v", "ts", "webm", "mp3", "flac", "srt", "sub", "ass", "vtt",
];

pub const DEFAULT_LIBRARY_DIR: &str = ".reeldrop/library";
pub const DEFAULT_STAGING_DIR: &str = ".reeldrop/staging";

pub const SESSION_SWEEP_INTERVAL_SECS: u64 = 30 * 60;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 48 * 60 * 60;
pub const SESSION_RECENT_WINDOW_SECS: u64 = 30 * 60;
pub const SESSION_MIN_AGE_SECS: u64 = 60 * 60;
pub const STAGING_SWEEP_INTERVAL_SECS: u64 = 6 * 60 * 60;
pub const DEFAULT_STAGING_TTL_SECS: u64 = 48 * 60 * 60;

// Client-side scheduling policy.
pub const MAX_CHUNK_RETRIES: u32 = 5;
pub const BACKOFF_BASE_MS: u64 = 1_000;
pub const BACKOFF_CAP_MS: u64 = 60_000;
pub const MAX_PARALLELISM: usize = 5;
pub const INITIAL_PARALLELISM: usize = 3;
pub const THROUGHPUT_EMA_ALPHA: f64 = 0.3;
pub const TIMEOUT_SAFETY_FACTOR: f64 = 3.0;
pub const MIN_CHUNK_TIMEOUT_SECS: u64 = 30;
pub const MAX_CHUNK_TIMEOUT_SECS: u64 = 300;
pub const PROGRESS_TICK_MS: u64 = 500;
pub const ADJUST_INTERVAL_SECS: u64 = 3;
pub const RESYNC_INTERVAL_SECS: u64 = 15;
pub const STUCK_SCAN_INTERVAL_SECS: u64 = 10;
pub const STUCK_MIN_ELAPSED_SECS: u64 = 120;
pub const STUCK_PROGRESS_FRACTION: f64 = 0.10;
pub const STUCK_DURATION_FRACTION: f64 = 0.5;
pub const PERSIST_MAX_AGE_SECS: i64 = 24 * 60 * 60;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "reeldrop", version, about = "Reeldrop media upload server")]
pub struct Args {
    #[arg(
        short = 'l',
        long,
        env = "REELDROP_LIBRARY_DIR",
        default_value = DEFAULT_LIBRARY_DIR,
        help = "Library directory where finished files land"
    )]
    pub library_dir: String,
    #[arg(
        long,
        env = "REELDROP_STAGING_DIR",
        default_value = DEFAULT_STAGING_DIR,
        help = "Staging directory for in-flight uploads"
    )]
    pub staging_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "REELDROP_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "REELDROP_PORT",
        default_value_t = 5015,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "REELDROP_CORS_ORIGINS",
        help = "Comma separated CORS origins"
    )]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "REELDROP_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Idle time before an upload session may be evicted"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "REELDROP_STAGING_TTL_SECS",
        default_value_t = DEFAULT_STAGING_TTL_SECS,
        help = "Age before an orphaned staging directory is removed (0 to disable)"
    )]
    pub staging_ttl_secs: u64,
    #[arg(
        long,
        env = "REELDROP_MAX_UPLOAD_SIZE",
        default_value_t = 0,
        help = "Max upload total size in bytes (0 to disable)"
    )]
    pub max_upload_size: u64,
}
