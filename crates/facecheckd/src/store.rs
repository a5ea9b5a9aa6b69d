use facecheck_core::{ImagePayload, ReferenceKey, ReferenceResolver, ResolveError};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

const MAX_KEY_LEN: usize = 64;
/// Binary containers, looked up in this order before the base64 text form.
const BINARY_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const TEXT_EXTENSION: &str = "b64";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid subject key {0:?}: expected 1-64 characters of [A-Za-z0-9_-]")]
    InvalidKey(String),
    #[error("reference store I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Reference images kept as one file per subject in a single directory.
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Open the store, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        tracing::info!(path = %root.display(), "reference store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read the stored reference for `key`, if any.
    pub fn load(&self, key: &ReferenceKey) -> Result<Option<ImagePayload>, StoreError> {
        validate_key(key)?;

        for ext in BINARY_EXTENSIONS {
            if let Some(bytes) = read_if_exists(&self.path_for(key, ext))? {
                return Ok(Some(ImagePayload::Binary(bytes)));
            }
        }
        match read_if_exists(&self.path_for(key, TEXT_EXTENSION))? {
            Some(bytes) => Ok(Some(ImagePayload::Base64(String::from_utf8_lossy(&bytes).into_owned()))),
            None => Ok(None),
        }
    }

    /// Store JPEG bytes as `<key>.jpg`, replacing any previous reference.
    ///
    /// The bytes go to a temporary file in the same directory that is then
    /// renamed into place, so readers never see a partial image.
    pub fn store(&self, key: &ReferenceKey, jpeg: &[u8]) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        let target = self.path_for(key, "jpg");

        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(jpeg)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;

        // Only one stored form per subject.
        for ext in BINARY_EXTENSIONS.iter().copied().filter(|e| *e != "jpg").chain([TEXT_EXTENSION]) {
            match std::fs::remove_file(self.path_for(key, ext)) {
                Ok(()) => tracing::debug!(subject = %key, ext, "removed superseded reference"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        tracing::info!(subject = %key, bytes = jpeg.len(), path = %target.display(), "reference stored");
        Ok(target)
    }

    fn path_for(&self, key: &ReferenceKey, ext: &str) -> PathBuf {
        self.root.join(format!("{}.{ext}", key.as_str()))
    }
}

impl ReferenceResolver for DirectoryStore {
    fn resolve(&self, key: &ReferenceKey) -> Result<Option<ImagePayload>, ResolveError> {
        self.load(key).map_err(|e| ResolveError(e.to_string()))
    }
}

/// Keys are restricted to `[A-Za-z0-9_-]{1,64}` so they can never name a path
/// outside the store directory.
pub fn validate_key(key: &ReferenceKey) -> Result<(), StoreError> {
    let k = key.as_str();
    let valid = !k.is_empty()
        && k.len() <= MAX_KEY_LEN
        && k.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(k.to_string()))
    }
}

fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>, std::io::Error> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
