//! Configuration from the environment

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;

use crate::sync::SyncSettings;
use crate::utils::env_millis_or;
use crate::utils::env_parse_or;
use crate::utils::env_var;
use crate::utils::env_var_or_else;

const DEFAULT_ADDRESS: &str = "0.0.0.0:6000";

/// Where the local mirror keeps its notes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MirrorConfig {
    /// In memory, lost on shutdown
    Memory,

    /// One file per entity in a directory
    Directory(PathBuf),
}

/// Which remote store to sync with
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteConfig {
    /// An in-process store, only shared by this process
    Memory,

    /// A Postgres database
    #[cfg(feature = "postgres")]
    Postgres(String),
}

/// Notesync configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub address: SocketAddr,
    pub mirror: MirrorConfig,
    pub remote: RemoteConfig,
    pub sync: SyncSettings,
}

impl Config {
    /// Detect configuration from the environment
    ///
    /// # Errors
    ///
    /// Will return `Err` when a variable is set to something invalid
    pub fn from_env() -> Result<Self> {
        let defaults = SyncSettings::default();

        let sync = SyncSettings {
            cache_ttl: env_millis_or("CACHE_TTL_MS", defaults.cache_ttl)?,
            read_timeout: env_millis_or("READ_TIMEOUT_MS", defaults.read_timeout)?,
            write_timeout: env_millis_or("WRITE_TIMEOUT_MS", defaults.write_timeout)?,
            breaker_cooldown: env_millis_or("BREAKER_COOLDOWN_MS", defaults.breaker_cooldown)?,
            breaker_failure_threshold: env_parse_or(
                "BREAKER_FAILURE_THRESHOLD",
                defaults.breaker_failure_threshold,
            )?,
        };

        let mirror = env_var("MIRROR_PATH").map_or(MirrorConfig::Memory, |path| {
            MirrorConfig::Directory(PathBuf::from(path))
        });

        Ok(Self {
            address: setup_address()?,
            mirror,
            remote: setup_remote(),
            sync,
        })
    }
}

#[cfg(not(feature = "postgres"))]
fn setup_remote() -> RemoteConfig {
    tracing::info!("Using the in-process remote store, notes are not shared between processes");

    RemoteConfig::Memory
}

#[cfg(feature = "postgres")]
fn setup_remote() -> RemoteConfig {
    match env_var("DATABASE_URL") {
        Some(database_url) => RemoteConfig::Postgres(database_url),
        None => {
            tracing::info!("`DATABASE_URL` is not set, using the in-process remote store");
            RemoteConfig::Memory
        }
    }
}

fn setup_address() -> Result<SocketAddr> {
    let mut address =
        env_var_or_else("ADDRESS", || String::from(DEFAULT_ADDRESS)).parse::<SocketAddr>()?;

    // optional override of just the port
    if let Some(port) = env_var("PORT") {
        address.set_port(port.parse::<u16>()?);
    }

    Ok(address)
}
