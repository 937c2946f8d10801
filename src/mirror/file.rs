//! File key-value store
//!
//! One file per key in a directory, survives restarts. Keys are percent-encoded into file names so
//! any key maps to a valid file name on every platform.

use std::borrow::Cow;
use std::fs;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use percent_encoding::NON_ALPHANUMERIC;
use percent_encoding::percent_decode_str;
use percent_encoding::utf8_percent_encode;

use super::KeyValueStore;
use super::StoreError;

const EXTENSION: &str = "json";

/// A key-value store backed by a directory
#[derive(Debug)]
pub struct File {
    directory: PathBuf,
}

impl File {
    /// Open the store, creating the directory when needed
    pub fn open<P>(directory: P) -> Result<Self, StoreError>
    where
        P: AsRef<Path>,
    {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        tracing::debug!("Mirror directory: {}", directory.display());

        Ok(Self { directory })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{}.{EXTENSION}", encode_key(key)))
    }
}

impl KeyValueStore for File {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path(key);
        let temporary = path.with_extension("tmp");

        // write next to the target and rename, a crash never leaves a half-written list
        let mut file = fs::File::create(&temporary)?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temporary, &path)?;

        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path(key)) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();

        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();

            if path.extension().and_then(|extension| extension.to_str()) != Some(EXTENSION) {
                continue;
            }

            let key = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(decode_key);

            if let Some(key) = key.filter(|key| key.starts_with(prefix)) {
                keys.push(key);
            }
        }

        keys.sort();

        Ok(keys)
    }
}

/// Percent-encode everything but ASCII alphanumerics
fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, NON_ALPHANUMERIC).to_string()
}

fn decode_key(encoded: &str) -> Option<String> {
    percent_decode_str(encoded)
        .decode_utf8()
        .ok()
        .map(Cow::into_owned)
}
