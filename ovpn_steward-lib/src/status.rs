//! Reader for the daemon's periodically rewritten status file.

use thiserror::Error;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

const CLIENT_PREFIX: &str = "CLIENT_LIST";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Client {
    pub real_address: String,
    pub virt_address: String,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connected_since: u64,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// Snapshot of connected clients keyed by client id.
///
/// A missing file is a normal state during daemon startup and yields an
/// empty snapshot. Rows that are short or unparsable are skipped; the
/// daemon rewrites the file wholesale, so a torn read heals on the next
/// poll.
pub fn read(path: &Path) -> Result<HashMap<String, Client>, Error> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(Error::IO(e)),
    };

    let mut clients = HashMap::new();
    for line in content.lines() {
        if !line.starts_with(CLIENT_PREFIX) {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 8 {
            continue;
        }
        let (Ok(bytes_received), Ok(bytes_sent), Ok(connected_since)) = (
            fields[4].parse::<u64>(),
            fields[5].parse::<u64>(),
            fields[7].parse::<u64>(),
        ) else {
            continue;
        };
        clients.insert(
            fields[1].to_string(),
            Client {
                real_address: fields[2].to_string(),
                virt_address: fields[3].to_string(),
                bytes_received,
                bytes_sent,
                connected_since,
            },
        );
    }
    Ok(clients)
}
