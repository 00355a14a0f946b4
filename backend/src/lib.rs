//! Mediaflow: download orchestration and media library ingestion
//!
//! Downloads are started from direct-download URLs or torrents, tracked in
//! SQLite, and once finished filed into a Plex-style media library.

pub mod config;
pub mod db;
pub mod jobs;
pub mod services;
