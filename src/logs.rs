//! Per-service log files and child output capture.
use std::{
    collections::VecDeque,
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    sync::LazyLock,
};

use chrono::Utc;
use regex::Regex;
use tokio::{
    fs::OpenOptions,
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader as AsyncBufReader},
};
use tracing::{debug, warn};

use crate::constants::PROCESS_CHECK_INTERVAL;

const MAX_CONSECUTIVE_READ_ERRORS: u32 = 5;

/// Prefix of the line written to a service log each time the service is launched.
pub const SESSION_MARKER: &str = "=== warden: launching";

static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|exception|traceback|fatal|panic(ked)?|failed)\b")
        .expect("static regex is valid")
});

/// Which child stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// Returns the log file for a service inside `logs_dir`.
pub fn resolve_log_path(logs_dir: &Path, service: &str) -> PathBuf {
    logs_dir.join(format!("{service}.log"))
}

/// Whether a line of child output looks like an error.
pub fn is_error_line(line: &str) -> bool {
    ERROR_LINE.is_match(line)
}

/// Appends a launch separator so later scans only see output of the current run.
pub async fn mark_session_start(log_path: &Path, service: &str, command: &str) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await?;
    let line = format!("{SESSION_MARKER} '{service}' at {}: {command}\n", Utc::now().to_rfc3339());
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

/// Spawns a task that copies `reader` line by line into the service log file.
///
/// Output that is not valid UTF-8 is logged lossily. The pipe is drained until the child
/// closes it, even when the log file cannot be written, so the child never hits a broken pipe.
/// Error-looking lines are additionally surfaced through `warn!`.
pub fn spawn_log_writer<R>(service: &str, reader: R, stream: Stream, log_path: PathBuf)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let service = service.to_string();
    tokio::spawn(async move {
        let mut file = match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(file) => Some(file),
            Err(err) => {
                warn!(
                    "Unable to open log file {} for '{service}': {err}",
                    log_path.display()
                );
                None
            }
        };

        let mut reader = AsyncBufReader::new(reader);
        let mut buf = Vec::new();
        let mut read_errors = 0;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => read_errors = 0,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    read_errors += 1;
                    warn!("Failed to read {} of '{service}': {err}", stream.as_str());
                    if read_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                        break;
                    }
                    tokio::time::sleep(PROCESS_CHECK_INTERVAL).await;
                    continue;
                }
            }
            let decoded = String::from_utf8_lossy(&buf);
            let line = decoded.trim_end_matches(['\n', '\r']);

            if is_error_line(line) {
                warn!(service = %service, stream = stream.as_str(), "{line}");
            } else {
                debug!(service = %service, stream = stream.as_str(), "{line}");
            }

            if let Some(handle) = file.as_mut() {
                let entry = format!("[{}] {line}\n", stream.as_str());
                if let Err(err) = handle.write_all(entry.as_bytes()).await {
                    warn!("Failed to write log line for '{service}': {err}");
                    file = None;
                }
            }
        }

        if let Some(mut handle) = file {
            let _ = handle.flush().await;
        }
    });
}

/// Reads up to the last `lines` lines written since the latest launch separator.
///
/// Missing files yield an empty list.
pub fn tail(path: &Path, lines: usize) -> Vec<String> {
    let Ok(file) = File::open(path) else {
        return Vec::new();
    };

    let mut reader = BufReader::new(file);
    let mut buffer: VecDeque<String> = VecDeque::with_capacity(lines);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&raw)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        if line.starts_with(SESSION_MARKER) {
            buffer.clear();
            continue;
        }
        if buffer.len() == lines {
            buffer.pop_front();
        }
        buffer.push_back(line);
    }
    buffer.into()
}

/// Returns the markers (lower-cased) found in the last `lines` lines of the log.
pub fn find_markers(path: &Path, markers: &[String], lines: usize) -> Vec<String> {
    let recent: Vec<String> = tail(path, lines)
        .into_iter()
        .map(|line| line.to_ascii_lowercase())
        .collect();

    let mut found = Vec::new();
    for marker in markers {
        let needle = marker.to_ascii_lowercase();
        if !found.contains(&needle) && recent.iter().any(|line| line.contains(&needle)) {
            found.push(needle);
        }
    }
    found
}
