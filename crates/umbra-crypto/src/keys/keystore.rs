//! File-based identity keystore
//!
//! One file per key component, owner-read/write only (0600):
//!
//! - `mldsa.key`    — post-quantum signing keypair (bincode)
//! - `ed25519.key`  — classical signing seed (32 raw bytes)
//! - `node.id`      — derived NodeID (hex, informational)
//!
//! The NodeID file is never read back as a source of truth; it is re-derived
//! from the classical key on load and the stored copy is only for operators.

use crate::error::{CryptoError, Result};
use crate::keys::identity::IdentityKeyPair;
use crate::sig::{ed25519::Ed25519Signer, mldsa::MlDsaSigner, HybridSigner};
use std::fs;
use std::path::{Path, PathBuf};

/// File name for the post-quantum signing key
const MLDSA_KEY_FILE: &str = "mldsa.key";
/// File name for the classical signing seed
const ED25519_KEY_FILE: &str = "ed25519.key";
/// File name for the derived NodeID
const NODE_ID_FILE: &str = "node.id";

/// Identity keystore rooted at a directory
pub struct Keystore {
    dir: PathBuf,
}

impl Keystore {
    /// Open a keystore at the given directory, creating it if needed
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self { dir })
    }

    /// Whether an identity already exists on disk
    pub fn has_identity(&self) -> bool {
        self.dir.join(MLDSA_KEY_FILE).exists() && self.dir.join(ED25519_KEY_FILE).exists()
    }

    /// Load the stored identity, or generate and persist a fresh one
    pub fn load_or_generate(&self) -> Result<IdentityKeyPair> {
        if self.has_identity() {
            self.load()
        } else {
            let identity = IdentityKeyPair::generate();
            self.save(&identity)?;
            Ok(identity)
        }
    }

    /// Load the stored identity
    pub fn load(&self) -> Result<IdentityKeyPair> {
        let mldsa_bytes = fs::read(self.dir.join(MLDSA_KEY_FILE))?;
        let mldsa: MlDsaSigner = bincode::deserialize(&mldsa_bytes)?;

        let seed_bytes = fs::read(self.dir.join(ED25519_KEY_FILE))?;
        let seed: [u8; 32] = seed_bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey("classical key file must hold exactly 32 bytes".to_string())
        })?;
        let ed25519 = Ed25519Signer::from_seed(seed);

        Ok(IdentityKeyPair::from_signer(HybridSigner::from_parts(
            mldsa, ed25519,
        )))
    }

    /// Persist an identity, one file per component
    pub fn save(&self, identity: &IdentityKeyPair) -> Result<()> {
        let signer = identity.signer();

        write_private(
            &self.dir.join(MLDSA_KEY_FILE),
            &bincode::serialize(signer.mldsa())?,
        )?;
        write_private(
            &self.dir.join(ED25519_KEY_FILE),
            &signer.ed25519().secret_bytes(),
        )?;
        write_private(
            &self.dir.join(NODE_ID_FILE),
            identity.id().to_hex().as_bytes(),
        )?;

        Ok(())
    }

    /// Path of the keystore directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Write a file with owner-only permissions
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_then_load() {
        let dir = tempdir().unwrap();
        let store = Keystore::open(dir.path()).unwrap();

        assert!(!store.has_identity());
        let generated = store.load_or_generate().unwrap();
        assert!(store.has_identity());

        let loaded = store.load().unwrap();
        assert_eq!(generated.id(), loaded.id());

        // Same keys: signatures verify under the original public key
        let sig = loaded.signer().sign(b"probe").unwrap();
        assert!(crate::sig::hybrid::verify(&generated.signer().public_key(), b"probe", &sig).is_ok());
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let dir = tempdir().unwrap();
        let store = Keystore::open(dir.path()).unwrap();

        let first = store.load_or_generate().unwrap();
        let second = store.load_or_generate().unwrap();
        assert_eq!(first.id(), second.id());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_files_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = Keystore::open(dir.path()).unwrap();
        store.load_or_generate().unwrap();

        for file in [MLDSA_KEY_FILE, ED25519_KEY_FILE, NODE_ID_FILE] {
            let mode = fs::metadata(dir.path().join(file))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600, "{} must be 0600", file);
        }
    }
}
