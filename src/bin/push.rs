//! Command-line uploader: drives one file to a Reeldrop server.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use reeldrop::logging;
use reeldrop::{TransferProgress, UploadClient};

#[derive(Parser, Debug)]
#[command(
    name = "reeldrop-push",
    version,
    about = "Upload a media file to a Reeldrop server"
)]
struct PushArgs {
    #[arg(help = "Source media file")]
    file: PathBuf,
    #[arg(
        short = 's',
        long,
        env = "REELDROP_SERVER",
        default_value = "http://127.0.0.1:5015",
        help = "Server base URL"
    )]
    server: String,
    #[arg(short = 'f', long, help = "Target folder inside the library")]
    folder: Option<String>,
    #[arg(long, help = "Target directory path inside the library")]
    destination: Option<String>,
    #[arg(long, help = "Chunk size override in bytes")]
    chunk_size: Option<u64>,
    #[arg(
        long,
        env = "REELDROP_STATE_DIR",
        help = "Directory for local session records"
    )]
    state_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init_logging();
    let args = PushArgs::parse();

    let mut client = UploadClient::new(&args.file, args.server.as_str());
    if let Some(folder) = args.folder {
        client = client.with_folder(folder);
    }
    if let Some(destination) = args.destination {
        client = client.with_destination(destination);
    }
    if let Some(chunk_size) = args.chunk_size {
        client = client.with_chunk_size(chunk_size);
    }
    if let Some(state_dir) = args.state_dir {
        client = client.with_state_dir(state_dir);
    }
    client.on_progress(print_progress);

    let cancel = client.cancel_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        eprintln!("\ncancelling...");
        cancel.cancel();
    });

    let plan = match client.init().await {
        Ok(plan) => plan,
        Err(err) => {
            eprintln!("init failed: {err}");
            return ExitCode::FAILURE;
        }
    };
    eprintln!(
        "session {} opened: {} chunks of {}",
        plan.upload_id,
        plan.total_chunks,
        format_bytes(plan.chunk_size)
    );

    match client.upload_all().await {
        Ok(done) => {
            eprintln!();
            println!("{}", done.path);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("\nupload failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn print_progress(progress: TransferProgress) {
    let eta = progress
        .time_remaining
        .map(format_duration)
        .unwrap_or_else(|| "--".to_string());
    eprint!(
        "\r{:>6.2}%  {}/{} chunks  {}/s  eta {}   ",
        progress.percentage,
        progress.chunks_completed,
        progress.total_chunks,
        format_bytes(progress.upload_speed as u64),
        eta
    );
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
