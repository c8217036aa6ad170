use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, Once, PoisonError};

use chrono::Utc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static TRACING_INIT: Once = Once::new();

/// The open daily file, if any. Events are dropped while this is `None`.
static DAILY: Mutex<Option<DailyFile>> = Mutex::new(None);

fn daily() -> MutexGuard<'static, Option<DailyFile>> {
    DAILY.lock().unwrap_or_else(PoisonError::into_inner)
}

fn today() -> String {
    Utc::now().format("%Y%m%d").to_string()
}

fn daily_file_name(day: &str) -> String {
    format!("dirsave-{day}.ndjson")
}

/// Append handle on one day's NDJSON file. Moves on to the next day's file
/// the first time a record arrives after the UTC date changed.
#[derive(Debug)]
struct DailyFile {
    dir: PathBuf,
    day: String,
    out: BufWriter<File>,
}

impl DailyFile {
    fn open(dir: &Path, day: String) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(daily_file_name(&day)))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            day,
            out: BufWriter::new(file),
        })
    }

    fn path(&self) -> PathBuf {
        self.dir.join(daily_file_name(&self.day))
    }

    /// Appends one formatted record to `day`'s file.
    fn append(&mut self, day: &str, record: &[u8]) -> std::io::Result<()> {
        if self.day != day {
            self.out.flush()?;
            *self = Self::open(&self.dir, day.to_string())?;
        }
        self.out.write_all(record)
    }

    fn finish(mut self) -> std::io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }
}

/// Handed to the JSON layer per event. The layer formats a whole event before
/// writing, so every `write` call is one complete NDJSON line.
struct DailyWriter;

impl Write for DailyWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(file) = daily().as_mut() {
            file.append(&today(), buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match daily().as_mut() {
            Some(file) => file.out.flush(),
            None => Ok(()),
        }
    }
}

fn build_env_filter_from(dirsave_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    dirsave_log
        .or(rust_log)
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Installs the global subscriber once: env filter plus JSON lines into the
/// daily file. Safe to call repeatedly.
pub fn init_logging() {
    TRACING_INIT.call_once(|| {
        let filter = build_env_filter_from(
            std::env::var("DIRSAVE_LOG").ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
        );
        let json = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(|| DailyWriter);

        let _ = tracing_subscriber::registry().with(filter).with(json).try_init();
    });
}

/// Keeps the daily log open. Dropping it flushes and syncs the current file
/// and stops further records from being written.
#[derive(Debug)]
pub struct DailyLogGuard {
    path: PathBuf,
}

impl DailyLogGuard {
    /// The file opened for the current day. Records written after midnight
    /// UTC land in the next day's file next to it.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DailyLogGuard {
    fn drop(&mut self) {
        if let Some(file) = daily().take() {
            let _ = file.finish();
        }
    }
}

/// Opens today's append-only log, `dirsave-YYYYMMDD.ndjson`, under
/// `DIRSAVE_LOG_DIR` or `<data_dir>/logs`. Only one can be open at a time.
pub fn open_daily_log(data_dir: &Path) -> std::io::Result<DailyLogGuard> {
    init_logging();

    let dir = std::env::var_os("DIRSAVE_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("logs"));
    std::fs::create_dir_all(&dir)?;

    let mut slot = daily();
    if slot.is_some() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "daily log already open",
        ));
    }
    let file = DailyFile::open(&dir, today())?;
    let path = file.path();
    *slot = Some(file);
    Ok(DailyLogGuard { path })
}
