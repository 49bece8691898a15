//! storage-tasks: runs blob, queue and table tasks declared in a YAML task file
//!
//! Usage:
//!   storage-tasks --tasks storage_tasks.yaml azure-table-insert:seed azure-table-query

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use storage_tasks::app_state::AppState;
use storage_tasks::config::{AppConfig, DEFAULT_CONFIG_FILE};
use storage_tasks::tasks::{TaskFile, TaskRunner};

#[derive(Parser, Debug)]
#[command(name = "storage-tasks")]
#[command(about = "Run storage blob, queue and table tasks")]
struct Args {
    /// Application config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Task file, defaults to the one named in the config
    #[arg(short, long)]
    tasks: Option<PathBuf>,

    /// log4rs config file, defaults to the one named in the config
    #[arg(long)]
    log_config: Option<PathBuf>,

    /// Tasks to run, `family` or `family:target`
    #[arg(required = true)]
    names: Vec<String>,
}

fn init_logging(path: &Path) {
    if path.exists() {
        if let Err(e) = log4rs::init_file(path, Default::default()) {
            eprintln!("Failed to load log config {}: {}", path.display(), e);
        } else {
            return;
        }
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let log_config = args
        .log_config
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.logging.config_file));
    init_logging(&log_config);

    let tasks_path = args.tasks.clone().unwrap_or_else(|| PathBuf::from(&config.tasks.file));
    let task_file = match TaskFile::load(&tasks_path) {
        Ok(file) => file,
        Err(e) => {
            error!("Failed to load task file {}: {}", tasks_path.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let base_dir = tasks_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let runner = TaskRunner::new(AppState::from_config(config), task_file).with_base_dir(base_dir);
    match runner.run(&args.names).await {
        Ok(reports) => {
            info!("{} task(s) completed", reports.len());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Aborted: {}", e);
            ExitCode::FAILURE
        }
    }
}
