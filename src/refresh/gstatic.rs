use certpeek::registry::{KnownLogRegistry, LogListError};
use log::info;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

pub const LOG_LIST_URL: &str = "https://www.gstatic.com/ct/log_list/v3/log_list.json";

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("Failed to download log list: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    LogList(#[from] LogListError),
    #[error("Failed to write {path}: {source}")]
    Write { path: String, source: io::Error },
}

/// Downloads the log list, merges it over `current` and writes the result to
/// `output`. Returns the number of logs written.
pub fn refresh_known_logs(
    output: &Path,
    current: &KnownLogRegistry,
    timeout: Option<Duration>,
) -> Result<usize, RefreshError> {
    info!("Fetching {}", LOG_LIST_URL);
    let mut client = reqwest::blocking::Client::builder();
    if let Some(timeout) = timeout {
        client = client.timeout(timeout);
    }
    let body = client
        .build()?
        .get(LOG_LIST_URL)
        .send()?
        .error_for_status()?
        .text()?;

    let fetched = KnownLogRegistry::from_log_list_json(&body)?;
    info!("Log list contains {} logs", fetched.len());
    let merged = current.clone().with_logs(fetched);

    fs::write(output, logs_to_toml(&merged)).map_err(|source| RefreshError::Write {
        path: output.display().to_string(),
        source,
    })?;
    Ok(merged.len())
}

/// One `"log id" = "name"` line per log, ordered by name.
pub fn logs_to_toml(logs: &KnownLogRegistry) -> String {
    logs.sorted_by_name()
        .into_iter()
        .map(|(id, name)| {
            format!(
                "{} = {}\n",
                toml::Value::String(id.to_string()),
                toml::Value::String(name.to_string())
            )
        })
        .collect()
}
