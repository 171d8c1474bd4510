//! Recording upload client.
//!
//! Runs on a backend server and pushes one meeting's recording archives to
//! the load balancer, one archive per published format. The format is the
//! archive's file name without extension. Every archive is retried on its
//! own; the exit status is non-zero when no archive was given, two archives
//! name the same format, or any upload failed.

use clap::Parser;
use common::retry::RetryPolicy;
use common::secret::SecretString;
use common::types::MeetingUuid;
use lb_service::services::recording_upload::format_of;
use lb_service::services::RecordingUploader;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "recording-upload", version, about = "Upload recording archives to the BBB load balancer")]
struct Cli {
    /// Base URL of the load balancer, e.g. https://lb.example.org
    #[arg(long, env = "LB_URL")]
    lb_url: String,

    /// Id of this backend server as registered with the load balancer
    #[arg(long, env = "LB_SERVER_ID")]
    server_id: String,

    /// Shared secret of this backend server
    #[arg(long, env = "LB_SERVER_SECRET", hide_env_values = true)]
    secret: String,

    /// Meeting UUID from the `meta_bbblb-uuid` tag
    #[arg(long)]
    meeting: MeetingUuid,

    /// Maximum attempts per archive
    #[arg(long, default_value_t = 10)]
    attempts: u32,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Archives to upload, named after their format (e.g. presentation.tar)
    archives: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lb_service=info,common=info".into()),
        )
        .init();

    let cli = Cli::parse();
    if cli.archives.is_empty() {
        error!("No archives given, nothing to upload");
        return ExitCode::FAILURE;
    }

    let mut formats = HashSet::new();
    for archive in &cli.archives {
        match format_of(archive) {
            Ok(format) if !formats.insert(format.clone()) => {
                error!(archive = %archive.display(), format = %format, "Format given twice, nothing uploaded");
                return ExitCode::FAILURE;
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Archive name is not a format, nothing uploaded");
                return ExitCode::FAILURE;
            }
        }
    }

    let uploader = match RecordingUploader::new(
        &cli.lb_url,
        &cli.server_id,
        SecretString::from(cli.secret),
        RetryPolicy::new(cli.attempts, Duration::from_secs(1)),
        Duration::from_secs(cli.timeout),
    ) {
        Ok(uploader) => uploader,
        Err(e) => {
            error!("Failed to set up uploader: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut all_uploaded = true;
    for archive in &cli.archives {
        match uploader.upload_file(cli.meeting, archive).await {
            Ok(receipt) => info!(
                archive = %archive.display(),
                attempts = receipt.attempts,
                import_id = receipt.import_id.as_deref().unwrap_or("-"),
                "Archive uploaded"
            ),
            Err(e) => {
                error!(archive = %archive.display(), error = %e, "Archive upload failed");
                all_uploaded = false;
            }
        }
    }

    if all_uploaded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
