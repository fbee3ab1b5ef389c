use crate::config::Config;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::{EitherWriter, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const LOG_FILE_NAME: &str = "cxauth.log";
const MAX_LOG_BYTES: u64 = 5 * 1024 * 1024;

/// Append-only JSON-lines log file, rotated to `cxauth.log.1` past a size cap.
pub struct RotatingLogFile {
    log_dir: PathBuf,
    log_file: PathBuf,
    max_log_bytes: u64,
}

impl RotatingLogFile {
    pub fn new(log_dir: PathBuf) -> Self {
        let log_file = log_dir.join(LOG_FILE_NAME);
        Self {
            log_dir,
            log_file,
            max_log_bytes: MAX_LOG_BYTES,
        }
    }

    #[cfg(test)]
    fn with_max_bytes(mut self, max_log_bytes: u64) -> Self {
        self.max_log_bytes = max_log_bytes;
        self
    }

    fn open(&self) -> io::Result<File> {
        fs::create_dir_all(&self.log_dir)?;
        self.rotate_if_needed()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)?;
        let _ = file.set_permissions(fs::Permissions::from_mode(0o600));
        Ok(file)
    }

    fn rotate_if_needed(&self) -> io::Result<()> {
        let size = match fs::metadata(&self.log_file) {
            Ok(metadata) => metadata.len(),
            Err(_) => return Ok(()),
        };
        if size <= self.max_log_bytes {
            return Ok(());
        }

        let rotated = self.log_dir.join(format!("{}.1", LOG_FILE_NAME));
        if rotated.exists() {
            let _ = fs::remove_file(&rotated);
        }
        fs::rename(&self.log_file, rotated)
    }
}

impl<'a> MakeWriter<'a> for RotatingLogFile {
    type Writer = EitherWriter<File, io::Sink>;

    fn make_writer(&'a self) -> Self::Writer {
        match self.open() {
            Ok(file) => EitherWriter::A(file),
            Err(_) => EitherWriter::B(io::sink()),
        }
    }
}

/// Installs the process-wide subscriber: warnings to stderr, everything the
/// configured filter admits to the JSON log file.
pub fn init(config: &Config) {
    let file_filter =
        EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = fmt::layer()
        .json()
        .with_writer(RotatingLogFile::new(config.log_dir()))
        .with_filter(file_filter);
    let stderr_layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(io::stderr)
        .with_filter(LevelFilter::WARN);

    let _ = tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init();
}
