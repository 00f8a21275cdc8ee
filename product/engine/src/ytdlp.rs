use crate::config::AuthParams;
use crate::paths::AppPaths;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Output file naming handed to `-o`; the video id keeps names stable.
pub const OUTPUT_TEMPLATE: &str = "%(id)s.%(ext)s";

/// How to invoke yt-dlp: a program plus arguments placed before the download
/// arguments (e.g. `python -m yt_dlp`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YtDlpCommand {
    pub program: PathBuf,
    pub prefix_args: Vec<String>,
}

impl YtDlpCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Prefers the copy under `tools/yt-dlp/`, falling back to `yt-dlp` on PATH.
    pub fn resolve(paths: &AppPaths) -> Self {
        let bundled = paths.bundled_yt_dlp_path();
        if bundled.exists() {
            return Self::new(bundled);
        }
        Self::new("yt-dlp")
    }

    pub fn display_name(&self) -> String {
        self.program.to_string_lossy().to_string()
    }
}

pub fn build_download_args(url: &str, download_dir: &Path, auth: &AuthParams) -> Vec<String> {
    let mut args = vec![
        url.to_string(),
        "-f".to_string(),
        "best".to_string(),
        "-o".to_string(),
        download_dir
            .join(OUTPUT_TEMPLATE)
            .to_string_lossy()
            .to_string(),
        "--no-warnings".to_string(),
        "--newline".to_string(),
        "--extractor-args".to_string(),
        "youtube:player_client=default".to_string(),
    ];

    if let Some(cookie_file) = auth.cookie_file.as_ref() {
        args.push("--cookies".to_string());
        args.push(cookie_file.to_string_lossy().to_string());
    }
    if let Some(browser) = auth
        .browser_name
        .as_deref()
        .map(str::trim)
        .filter(|b| !b.is_empty())
    {
        args.push("--cookies-from-browser".to_string());
        args.push(browser.to_string());
    }

    args
}

/// One line of yt-dlp output, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputLine {
    Destination(PathBuf),
    Progress(f64),
    Error(String),
    Info(String),
}

pub fn classify_line(line: &str) -> OutputLine {
    static DESTINATION_RE: OnceLock<Regex> = OnceLock::new();
    static MERGER_RE: OnceLock<Regex> = OnceLock::new();
    static ALREADY_RE: OnceLock<Regex> = OnceLock::new();
    static PROGRESS_RE: OnceLock<Regex> = OnceLock::new();

    let line = line.trim_end();

    if line.starts_with("ERROR:") {
        return OutputLine::Error(line.to_string());
    }

    let destination_re = DESTINATION_RE
        .get_or_init(|| Regex::new(r"^\[[^\]]+\] Destination: (.+)$").expect("destination regex"));
    if let Some(caps) = destination_re.captures(line) {
        return OutputLine::Destination(PathBuf::from(caps[1].trim()));
    }

    let merger_re = MERGER_RE.get_or_init(|| {
        Regex::new(r#"^\[Merger\] Merging formats into "(.+)"$"#).expect("merger regex")
    });
    if let Some(caps) = merger_re.captures(line) {
        return OutputLine::Destination(PathBuf::from(&caps[1]));
    }

    let already_re = ALREADY_RE.get_or_init(|| {
        Regex::new(r"^\[download\] (.+) has already been downloaded").expect("already regex")
    });
    if let Some(caps) = already_re.captures(line) {
        return OutputLine::Destination(PathBuf::from(caps[1].trim()));
    }

    let progress_re = PROGRESS_RE.get_or_init(|| {
        Regex::new(r"^\[download\]\s+(\d+(?:\.\d+)?)%").expect("progress regex")
    });
    if let Some(percent) = progress_re
        .captures(line)
        .and_then(|caps| caps[1].parse::<f64>().ok())
    {
        return OutputLine::Progress(percent);
    }

    OutputLine::Info(line.to_string())
}
