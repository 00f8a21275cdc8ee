use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use tubequeue_engine::downloads::Downloads;
use tubequeue_engine::notify::{ChannelObserver, NoopObserver, TaskObserver};
use tubequeue_engine::paths::AppPaths;
use tubequeue_engine::task::{Task, TaskStatus};

const SNAPSHOT_POLL_INTERVAL_MS: u64 = 500;

#[derive(Parser, Debug)]
#[command(name = "tubequeue")]
#[command(version)]
#[command(about = "Queue and run yt-dlp downloads with a concurrency limit", long_about = None)]
struct Cli {
    /// Directory holding the task database, logs and default downloads.
    /// Falls back to $TUBEQUEUE_BASE_DIR, then the platform data dir, then
    /// ./tubequeue-data.
    #[arg(long, value_name = "DIR")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    base_dir: Option<PathBuf>,

    #[arg(short, long, help = "Enable debug logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue one or more URLs and wait until the queue drains.
    Add {
        #[arg(required = true, value_name = "URL")]
        #[arg(value_hint = clap::ValueHint::Url)]
        urls: Vec<String>,
        #[arg(long, help = "Display title; only valid with a single URL")]
        title: Option<String>,
        #[arg(long, help = "Return right after queueing")]
        no_wait: bool,
    },
    /// Run every pending task until the queue drains.
    Run,
    /// Print all tasks.
    List,
    Pause {
        id: String,
    },
    Resume {
        id: String,
        #[arg(long)]
        no_wait: bool,
    },
    Retry {
        id: String,
        #[arg(long)]
        no_wait: bool,
    },
    Delete {
        id: String,
    },
    /// Show or change download settings.
    Settings {
        #[arg(long, value_name = "N")]
        max_concurrency: Option<usize>,
        #[arg(long, value_name = "DIR")]
        download_dir: Option<PathBuf>,
        #[arg(long, value_name = "FILE", help = "Cookie file; pass an empty string to clear")]
        cookie_file: Option<PathBuf>,
        #[arg(long, value_name = "NAME", help = "Browser to read cookies from; empty clears")]
        browser: Option<String>,
    },
}

fn main() -> Result<(), String> {
    let args = Cli::parse();
    if let Err(err) = validate(&args) {
        err.exit();
    }

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let base_dir = args.base_dir.unwrap_or_else(default_base_dir);
    let paths = AppPaths::new(AppPaths::normalize_base_dir(&base_dir));
    run(paths, args.command).map_err(|e| e.to_string())
}

fn run(paths: AppPaths, command: Command) -> tubequeue_engine::Result<()> {
    let wants_updates = matches!(
        command,
        Command::Add { no_wait: false, .. }
            | Command::Run
            | Command::Resume { no_wait: false, .. }
            | Command::Retry { no_wait: false, .. }
    );
    let (observer, updates) = if wants_updates {
        let (observer, rx) = ChannelObserver::new();
        (Arc::new(observer) as Arc<dyn TaskObserver>, Some(rx))
    } else {
        (Arc::new(NoopObserver) as Arc<dyn TaskObserver>, None)
    };

    // Only waiting commands dispatch. The rest leave stored states alone.
    let downloads = if wants_updates {
        Downloads::open(paths, observer)?
    } else {
        Downloads::open_idle(paths, observer)?
    };

    match command {
        Command::Add { urls, title, .. } => {
            for url in urls {
                let task = downloads.add(&url, title.clone())?;
                println!("queued {} {}", task.id, task.url);
            }
        }
        Command::Run => {}
        Command::List => {
            for task in downloads.list()? {
                print_task(&task);
            }
        }
        Command::Pause { id } => print_task(&downloads.pause(&id)?),
        Command::Resume { id, .. } => print_task(&downloads.resume(&id)?),
        Command::Retry { id, .. } => print_task(&downloads.retry(&id)?),
        Command::Delete { id } => {
            let outcome = downloads.delete(&id)?;
            println!("deleted {id} ({outcome:?})");
        }
        Command::Settings {
            max_concurrency,
            download_dir,
            cookie_file,
            browser,
        } => {
            if let Some(n) = max_concurrency {
                let applied = downloads.set_max_concurrency(n)?;
                if applied != n {
                    warn!(requested = n, applied, "max concurrency clamped");
                }
            }
            if let Some(dir) = download_dir {
                downloads.set_download_dir(&dir)?;
            }
            if let Some(file) = cookie_file {
                let file = Some(file).filter(|f| !f.as_os_str().is_empty());
                downloads.set_cookie_file(file.as_deref())?;
            }
            if let Some(name) = browser {
                downloads.set_browser_name(Some(name.as_str()).filter(|n| !n.trim().is_empty()))?;
            }
            let settings = downloads.settings()?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }

    if let Some(updates) = updates {
        loop {
            match updates.recv_timeout(Duration::from_millis(SNAPSHOT_POLL_INTERVAL_MS)) {
                Ok(task) => print_task(&task),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if downloads.snapshot()?.is_idle() {
                while let Ok(task) = updates.try_recv() {
                    print_task(&task);
                }
                break;
            }
        }
        let tasks = downloads.list()?;
        let failed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        info!(total = tasks.len(), failed, "queue drained");
    }

    downloads.shutdown()
}

fn validate(args: &Cli) -> Result<(), clap::Error> {
    if let Command::Add {
        urls,
        title: Some(_),
        ..
    } = &args.command
    {
        if urls.len() > 1 {
            return Err(Cli::command().error(
                clap::error::ErrorKind::ArgumentConflict,
                "--title applies to a single URL; add the URLs separately",
            ));
        }
    }
    Ok(())
}

fn default_base_dir() -> PathBuf {
    if let Ok(v) = std::env::var("TUBEQUEUE_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return PathBuf::from(t);
        }
    }

    let data_root = if cfg!(windows) {
        std::env::var("APPDATA").ok()
    } else {
        std::env::var("XDG_DATA_HOME").ok().or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|home| format!("{home}/.local/share"))
        })
    };
    match data_root.filter(|v| !v.trim().is_empty()) {
        Some(root) => PathBuf::from(root.trim()).join("tubequeue"),
        None => PathBuf::from("tubequeue-data"),
    }
}

fn print_task(task: &Task) {
    let mut line = format!(
        "{:<36}  {:<11}  {:>5}%  {}",
        task.id,
        task.status.as_str(),
        task.progress_text,
        task.label()
    );
    if let Some(path) = task.file_path.as_ref() {
        line.push_str(&format!("  -> {}", path.display()));
    }
    if !task.error_text.is_empty() {
        line.push_str(&format!("  [{}]", task.error_text));
    }
    println!("{line}");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        let cli = Cli::try_parse_from(args)?;
        validate(&cli)?;
        Ok(cli)
    }

    #[test]
    fn title_with_several_urls_is_rejected() {
        let err = parse(&["tubequeue", "add", "--title", "clip", "https://a", "https://b"])
            .expect_err("conflict");
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn title_with_one_url_is_accepted() {
        let cli = parse(&["tubequeue", "add", "--title", "clip", "https://a"]).expect("parse");
        assert!(matches!(
            cli.command,
            Command::Add { ref urls, title: Some(ref title), .. }
                if urls.len() == 1 && title == "clip"
        ));
        parse(&["tubequeue", "add", "https://a", "https://b"]).expect("no title");
    }
}
