//! Torrent metadata parsing utilities
//!
//! Reads the name, total size and infohash out of a .torrent file without
//! involving the torrent daemon. The infohash is the SHA-1 of the bencoded
//! `info` dictionary, re-encoded from the parsed value.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_bencode::value::Value;
use sha1::{Digest, Sha1};

/// What a download item needs to know about a torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    pub name: String,
    /// Sum of every file in the torrent, in bytes
    pub total_size: u64,
    /// Lowercase hex SHA-1 of the info dictionary
    pub info_hash: String,
}

#[derive(Debug, Deserialize)]
struct TorrentFile {
    length: u64,
}

#[derive(Debug, Deserialize)]
struct TorrentInfo {
    name: String,
    #[serde(default)]
    length: Option<u64>,
    #[serde(default)]
    files: Option<Vec<TorrentFile>>,
}

#[derive(Debug, Deserialize)]
struct Torrent {
    info: TorrentInfo,
}

#[derive(Debug, Deserialize)]
struct RawTorrent {
    info: Value,
}

/// Parse a .torrent file
pub fn parse_torrent(torrent_bytes: &[u8]) -> Result<TorrentMetadata> {
    let torrent: Torrent =
        serde_bencode::from_bytes(torrent_bytes).context("Failed to parse torrent file")?;

    let total_size = match (&torrent.info.files, torrent.info.length) {
        (Some(files), _) => files.iter().map(|f| f.length).sum(),
        (None, Some(length)) => length,
        (None, None) => bail!("Torrent info has neither length nor files"),
    };

    let raw: RawTorrent =
        serde_bencode::from_bytes(torrent_bytes).context("Failed to parse torrent info")?;
    let info_bytes = serde_bencode::to_bytes(&raw.info).context("Failed to encode torrent info")?;
    let info_hash = hex::encode(Sha1::digest(&info_bytes));

    Ok(TorrentMetadata {
        name: torrent.info.name,
        total_size,
        info_hash,
    })
}
