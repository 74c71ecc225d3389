use std::fs::OpenOptions;
use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::error::TrackingResult;

/// Installs the global fmt subscriber.
///
/// # Arguments
///
/// * `default_level` - Filter directive used when `RUST_LOG` is unset (e.g. `info`, `debug`)
///
/// # Returns
///
/// Nothing. A second call leaves the first subscriber in place.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // a second call (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Appends rows to a CSV file
///
/// # Arguments
///
/// * `path` - The CSV file; missing parent directories are created
/// * `headers` - Header record, written only when the file is new
/// * `rows` - Records to append, one `String` per column
///
/// # Returns
///
/// * `TrackingResult<()>` - Success, or the I/O or CSV error
pub fn log_csv<P, R>(path: P, headers: &[&str], rows: &[R]) -> TrackingResult<()>
where
    P: AsRef<Path>,
    R: AsRef<[String]>,
{
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file_exists = path.exists();

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    if !file_exists && !headers.is_empty() {
        writer.write_record(headers)?;
    }
    for row in rows {
        writer.write_record(row.as_ref())?;
    }
    writer.flush()?;

    Ok(())
}
