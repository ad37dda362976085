use std::process::{Command, ExitCode};

use tracing::{error, info};

use malcolm::bot;
use malcolm::config::ConfigStore;
use malcolm::types::BuildInfo;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    // Initialise tracing (respects RUST_LOG env, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [settings_path] = args.as_slice() else {
        eprintln!("usage: malcolm-next <settings.yaml>");
        return ExitCode::from(2);
    };

    let (config, token) = match ConfigStore::open(settings_path) {
        Ok(opened) => opened,
        Err(e) => {
            error!(path = %settings_path, error = %e, "failed to load settings");
            return ExitCode::FAILURE;
        }
    };

    let build = BuildInfo::new(git_commit());
    info!(version = %build.describe(), "starting");

    match bot::start(config, token, build).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "bot exited with an error");
            ExitCode::FAILURE
        }
    }
}

/// Short hash of the checked-out commit, when running from a git tree.
fn git_commit() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let commit = String::from_utf8(output.stdout).ok()?;
    let commit = commit.trim();
    (!commit.is_empty()).then(|| commit.to_string())
}
