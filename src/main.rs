use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use migro::cli::{Cli, Commands, InitArgs, S3Args, UrlsArgs, WELCOME};
use migro::coordinator::{Coordinator, RunOptions, RunSummary};
use migro::core::config::{self, Config};
use migro::db;
use migro::logging;
use migro::services::remote::UploadClient;
use migro::services::sources::{FileSource, S3Source, UrlListSource};
use migro::utils::format_size;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let env_file = config::load_env_file();

    let result = match cli.command {
        None => {
            print!("{}", WELCOME);
            Ok(())
        }
        Some(Commands::Init(args)) => init(&args, &env_file),
        Some(Commands::Urls(args)) => upload_urls(&args).await,
        Some(Commands::S3(args)) => upload_s3(&args).await,
        Some(Commands::Status) => status(),
        Some(Commands::Drop { yes }) => drop_all(yes, &env_file),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{}", style(format!("{:#}", e)).red());
            ExitCode::FAILURE
        }
    }
}

fn init(args: &InitArgs, env_file: &Path) -> Result<()> {
    let entries = args.env_entries();
    config::save_to_env_file(env_file, &entries)?;
    println!(
        "{}",
        style(format!("Configuration saved successfully to {}", env_file.display())).green()
    );
    Ok(())
}

fn start_logging(config: &Config) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let (guard, handle) = logging::init(Path::new(&config.logs_dir))?;
    if let Err(e) = logging::set_level(&handle, &config.log_level) {
        warn!("Failed to apply log level '{}': {:#}", config.log_level, e);
    }
    Ok(guard)
}

async fn upload_urls(args: &UrlsArgs) -> Result<()> {
    let mut config = config::load_config_from_env();
    args.apply(&mut config);
    config.validate()?;
    let _guard = start_logging(&config)?;

    let source = UrlListSource::new(&args.file);
    migrate(config, &source, args.skip_errors).await
}

async fn upload_s3(args: &S3Args) -> Result<()> {
    let mut config = config::load_config_from_env();
    args.apply(&mut config);
    if config.s3_bucket.as_deref().is_none_or(|b| b.trim().is_empty()) {
        anyhow::bail!(
            "AWS S3 bucket name cannot be empty. Please specify it through the command line option or environment variable."
        );
    }
    config.validate()?;
    let _guard = start_logging(&config)?;

    println!("Checking the credentials...");
    let source = S3Source::new(&config).await?;
    migrate(config, &source, args.skip_errors).await
}

async fn migrate(config: Config, source: &dyn FileSource, skip_errors: bool) -> Result<()> {
    info!(
        "Starting {} migration ({} concurrent uploads, {}s timeout)",
        source.tag(),
        config.max_concurrent_uploads,
        config.upload_timeout_secs
    );
    let conn = db::init_db(Path::new(&config.db_path))?;
    let conn = Arc::new(Mutex::new(conn));
    let config = Arc::new(config);
    let api = Arc::new(UploadClient::new(&config)?);

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(cancel_on_signal(cancel.clone()));

    println!("Collecting files and starting upload...");
    let coordinator = Coordinator::new(conn, config, api, cancel);
    let options = RunOptions {
        include_errors: !skip_errors,
        ..RunOptions::default()
    };
    let summary = coordinator.run(source, options).await;
    signals.abort();

    show_final_messages(&summary?);
    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let (Ok(mut term), Ok(mut hup)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        ) else {
            warn!("Failed to install signal handlers, only Ctrl-C cancels the run");
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
            return;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
            _ = hup.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    warn!("Signal received, cancelling upload");
    cancel.cancel();
}

fn show_final_messages(summary: &RunSummary) {
    println!("\n\nFile uploading has been finished!");
    let uploaded = format!("Uploaded files: {}", summary.successful);
    let failed = format!("Failed files: {}", summary.failed);
    if summary.successful > 0 {
        println!("{}", style(uploaded).green());
    } else {
        println!("{}", uploaded);
    }
    if summary.failed > 0 {
        println!("{}", style(failed).red());
    } else {
        println!("{}", failed);
    }
    if let Some(path) = &summary.report_path {
        println!("Check the results in \"{}\"", path.display());
    }
    println!("Thanks for your interest in Uploadcare.");
    println!("Hit us up at help@uploadcare.com in case of any questions.");
    if summary.cancelled {
        println!("\n\nFile uploading has been cancelled!");
    }
}

fn status() -> Result<()> {
    let config = config::load_config_from_env();
    let db_path = PathBuf::from(&config.db_path);
    if !db_path.exists() {
        println!("No migration database found at {}.", db_path.display());
        return Ok(());
    }
    let conn = db::init_db(&db_path)?;
    let summary = db::not_uploaded_summary(&conn)?;
    if summary.is_empty() {
        println!("{}", style("All known files are uploaded.").green());
        return Ok(());
    }

    let total: i64 = summary.iter().map(|s| s.count).sum();
    let total_size: i64 = summary.iter().map(|s| s.total_size).sum();
    println!(
        "Files not uploaded yet: {} ({})",
        total,
        format_size(total_size)
    );
    for row in &summary {
        println!(
            "  {:<8} {:>8} files  {:>10}",
            row.status,
            row.count,
            format_size(row.total_size)
        );
    }
    Ok(())
}

fn drop_all(yes: bool, env_file: &Path) -> Result<()> {
    if !yes && !confirm("Are you sure you want to drop database, config and logs?")? {
        return Ok(());
    }
    let config = config::load_config_from_env();

    let db_path = PathBuf::from(&config.db_path);
    for suffix in ["", "-wal", "-shm"] {
        let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
        remove_if_exists(&path)?;
    }
    remove_if_exists(env_file)?;

    let logs_dir = Path::new(&config.logs_dir);
    if logs_dir.is_dir() {
        for entry in std::fs::read_dir(logs_dir).context("read logs dir")? {
            let path = entry?.path();
            if path.is_file() {
                remove_if_exists(&path)?;
            }
        }
    }

    println!("{}", style("All data dropped successfully.").green());
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    let term = console::Term::stdout();
    term.write_str(&format!("{} [y/N]: ", prompt))?;
    let answer = term.read_line()?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
