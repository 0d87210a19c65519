//! Node identity persistence
//!
//! A node's long-lived identity is an Ed25519 keypair stored on disk as
//! the 32-byte secret key. Loaded at startup, generated if missing.

use std::path::{Component, Path, PathBuf};

use libp2p::identity::Keypair;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("failed to read keyfile: {0}")]
    Read(std::io::Error),

    #[error("failed to write keyfile: {0}")]
    Write(std::io::Error),

    #[error("invalid keyfile format: {0}")]
    InvalidFormat(String),

    #[error("failed to create directory: {0}")]
    CreateDir(std::io::Error),
}

/// Load an existing identity from disk, or generate and persist a new one.
///
/// The keyfile holds the 32-byte Ed25519 secret key. A leading `~` resolves
/// against the home directory; parent directories are created on first
/// generation.
pub fn load_or_generate_identity(keyfile: &Path) -> Result<Keypair, KeystoreError> {
    let path = resolve_keyfile(keyfile);

    match std::fs::read(&path) {
        Ok(bytes) => {
            let keypair = Keypair::ed25519_from_bytes(bytes)
                .map_err(|e| KeystoreError::InvalidFormat(e.to_string()))?;
            info!("loaded identity from {:?}", path);
            Ok(keypair)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => generate_identity(&path),
        Err(e) => Err(KeystoreError::Read(e)),
    }
}

fn generate_identity(path: &Path) -> Result<Keypair, KeystoreError> {
    let keypair = Keypair::generate_ed25519();
    let ed25519 = keypair
        .clone()
        .try_into_ed25519()
        .map_err(|_| KeystoreError::InvalidFormat("not an ed25519 key".to_string()))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(KeystoreError::CreateDir)?;
    }

    let secret = ed25519.secret();
    std::fs::write(path, secret.as_ref()).map_err(KeystoreError::Write)?;

    info!("generated new identity, saved to {:?}", path);
    Ok(keypair)
}

/// Resolve a keyfile location, substituting a leading `~` component with
/// the home directory. Paths without one pass through unchanged, as does a
/// `~` path on a machine with no home directory to resolve against.
fn resolve_keyfile(path: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == "~" => match home_directory() {
            Some(home) => home.join(components.as_path()),
            None => path.to_path_buf(),
        },
        _ => path.to_path_buf(),
    }
}

fn home_directory() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_generate_then_load() {
        let temp_dir = std::env::temp_dir().join("onionp2p_test_identity");
        let _ = fs::remove_dir_all(&temp_dir);

        let keyfile = temp_dir.join("node.key");

        let first = load_or_generate_identity(&keyfile).unwrap();
        assert!(keyfile.exists());

        let second = load_or_generate_identity(&keyfile).unwrap();
        assert_eq!(
            first.public().to_peer_id(),
            second.public().to_peer_id()
        );

        let _ = fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_invalid_keyfile() {
        let temp_dir = std::env::temp_dir().join("onionp2p_test_invalid_identity");
        let _ = fs::remove_dir_all(&temp_dir);
        fs::create_dir_all(&temp_dir).unwrap();

        let keyfile = temp_dir.join("bad.key");
        fs::write(&keyfile, b"short").unwrap();

        assert!(load_or_generate_identity(&keyfile).is_err());

        let _ = fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_resolve_tilde() {
        if home_directory().is_none() {
            return;
        }
        let resolved = resolve_keyfile(Path::new("~/keys/node.key"));
        assert!(!resolved.starts_with("~"));
        assert!(resolved.ends_with("keys/node.key"));
    }

    #[test]
    fn test_resolve_leaves_other_paths_alone() {
        let absolute = Path::new("/etc/onionp2p/node.key");
        assert_eq!(resolve_keyfile(absolute), absolute);

        // A mid-path tilde is a literal directory name, not a home marker.
        let literal = Path::new("keys/~/node.key");
        assert_eq!(resolve_keyfile(literal), literal);
    }
}
