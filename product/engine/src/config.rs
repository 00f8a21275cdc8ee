use crate::db::{self, OptionalRowExt};
use crate::paths::AppPaths;
use crate::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const MIN_MAX_CONCURRENT_DOWNLOADS: usize = 1;
pub const MAX_MAX_CONCURRENT_DOWNLOADS: usize = 10;
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

const META_KEY_DOWNLOAD_DIR: &str = "download_dir";
const META_KEY_MAX_CONCURRENCY: &str = "download_max_concurrency";
const META_KEY_BROWSER_COOKIE_FILE: &str = "browser_cookie_file";
const META_KEY_BROWSER_NAME: &str = "browser_name";

pub fn clamp_concurrency(value: usize) -> usize {
    value.clamp(MIN_MAX_CONCURRENT_DOWNLOADS, MAX_MAX_CONCURRENT_DOWNLOADS)
}

/// Credentials forwarded verbatim to yt-dlp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthParams {
    /// Netscape cookie file passed as `--cookies`.
    pub cookie_file: Option<PathBuf>,
    /// Browser name passed as `--cookies-from-browser`.
    pub browser_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSettings {
    pub download_dir: PathBuf,
    pub max_concurrency: usize,
    pub auth: AuthParams,
}

impl DownloadSettings {
    pub fn defaults(paths: &AppPaths) -> Self {
        Self {
            download_dir: paths.default_download_dir(),
            max_concurrency: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            auth: AuthParams::default(),
        }
    }
}

/// Loads settings from the `meta` table. Keys that are missing are filled
/// with defaults and written back.
pub fn load_download_settings(paths: &AppPaths) -> Result<DownloadSettings> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    load_download_settings_conn(&conn, paths)
}

fn load_download_settings_conn(conn: &Connection, paths: &AppPaths) -> Result<DownloadSettings> {
    let defaults = DownloadSettings::defaults(paths);

    let download_dir = match read_meta(conn, META_KEY_DOWNLOAD_DIR)? {
        Some(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => {
            let value = defaults.download_dir.to_string_lossy().to_string();
            write_meta(conn, META_KEY_DOWNLOAD_DIR, &value)?;
            defaults.download_dir.clone()
        }
    };

    let max_concurrency = match read_meta(conn, META_KEY_MAX_CONCURRENCY)? {
        Some(v) => match v.trim().parse::<usize>() {
            Ok(parsed) => clamp_concurrency(parsed),
            Err(_) => defaults.max_concurrency,
        },
        None => {
            write_meta(
                conn,
                META_KEY_MAX_CONCURRENCY,
                &defaults.max_concurrency.to_string(),
            )?;
            defaults.max_concurrency
        }
    };

    let cookie_file = read_optional_setting(conn, META_KEY_BROWSER_COOKIE_FILE)?.map(PathBuf::from);
    let browser_name = read_optional_setting(conn, META_KEY_BROWSER_NAME)?;

    Ok(DownloadSettings {
        download_dir,
        max_concurrency,
        auth: AuthParams {
            cookie_file,
            browser_name,
        },
    })
}

/// Stores a clamped limit and returns the stored value.
pub fn save_max_concurrency(paths: &AppPaths, value: usize) -> Result<usize> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    let value = clamp_concurrency(value);
    write_meta(&conn, META_KEY_MAX_CONCURRENCY, &value.to_string())?;
    Ok(value)
}

pub fn save_download_dir(paths: &AppPaths, dir: &std::path::Path) -> Result<()> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    write_meta(&conn, META_KEY_DOWNLOAD_DIR, &dir.to_string_lossy())
}

pub fn save_cookie_file(paths: &AppPaths, file: Option<&std::path::Path>) -> Result<()> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    let value = file.map(|f| f.to_string_lossy().to_string()).unwrap_or_default();
    write_meta(&conn, META_KEY_BROWSER_COOKIE_FILE, &value)
}

pub fn save_browser_name(paths: &AppPaths, name: Option<&str>) -> Result<()> {
    let conn = db::open(paths)?;
    db::migrate(&conn)?;
    write_meta(&conn, META_KEY_BROWSER_NAME, name.unwrap_or_default())
}

/// Empty values mean "not set", same as a missing key.
fn read_optional_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    match read_meta(conn, key)? {
        Some(v) => {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(trimmed.to_string()))
            }
        }
        None => {
            write_meta(conn, key, "")?;
            Ok(None)
        }
    }
}

fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM meta WHERE key=?1", [key], |row| row.get(0))
        .optional()?;
    Ok(value)
}

fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO meta(key, value) VALUES(?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_writes_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());

        let settings = load_download_settings(&paths).expect("load");
        assert_eq!(settings, DownloadSettings::defaults(&paths));

        let conn = db::open(&paths).expect("open");
        let stored = read_meta(&conn, META_KEY_MAX_CONCURRENCY).expect("read");
        assert_eq!(stored.as_deref(), Some("3"));
        let stored = read_meta(&conn, META_KEY_BROWSER_NAME).expect("read");
        assert_eq!(stored.as_deref(), Some(""));
    }

    #[test]
    fn saved_values_are_clamped_and_reloaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());

        assert_eq!(save_max_concurrency(&paths, 0).expect("save"), 1);
        assert_eq!(save_max_concurrency(&paths, 99).expect("save"), 10);
        save_download_dir(&paths, std::path::Path::new("/srv/media")).expect("dir");
        save_cookie_file(&paths, Some(std::path::Path::new("/tmp/cookies.txt"))).expect("cookie");
        save_browser_name(&paths, Some("firefox")).expect("browser");

        let settings = load_download_settings(&paths).expect("load");
        assert_eq!(settings.max_concurrency, 10);
        assert_eq!(settings.download_dir, PathBuf::from("/srv/media"));
        assert_eq!(
            settings.auth.cookie_file,
            Some(PathBuf::from("/tmp/cookies.txt"))
        );
        assert_eq!(settings.auth.browser_name.as_deref(), Some("firefox"));

        save_browser_name(&paths, None).expect("clear browser");
        let settings = load_download_settings(&paths).expect("reload");
        assert_eq!(settings.auth.browser_name, None);
    }

    #[test]
    fn out_of_range_stored_concurrency_is_clamped_on_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let conn = db::open(&paths).expect("open");
        db::migrate(&conn).expect("migrate");
        write_meta(&conn, META_KEY_MAX_CONCURRENCY, "250").expect("write");

        let settings = load_download_settings(&paths).expect("load");
        assert_eq!(settings.max_concurrency, MAX_MAX_CONCURRENT_DOWNLOADS);
    }
}
