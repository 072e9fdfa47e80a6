use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use ed25519_dalek::SigningKey;
use libp2p::identity::Keypair;
use rand::rngs::OsRng;

const IDENTITY_FILE_NAME: &str = "identity.key";

/// Load the relay's persisted Ed25519 identity from `persist_dir`, or generate and
/// persist a fresh one if none exists (or `regen` forces it). The returned keypair
/// seeds the libp2p `PeerId` the rest of the mesh recognizes this relay by — losing it
/// means rejoining as a stranger, so it's kept on disk across restarts the same way a
/// shared secret would be.
pub fn load_or_generate(persist_dir: &str, regen: bool) -> Result<Keypair> {
    let dir = Path::new(persist_dir);
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create persist dir {}", dir.display()))?;
    let key_path = dir.join(IDENTITY_FILE_NAME);

    if !regen {
        if let Ok(existing) = std::fs::read(&key_path) {
            match <[u8; 32]>::try_from(existing.as_slice()) {
                Ok(mut seed) => match Keypair::ed25519_from_bytes(seed) {
                    Ok(keypair) => {
                        tracing::info!(path = %key_path.display(), "loaded persisted relay identity");
                        return Ok(keypair);
                    }
                    Err(e) => {
                        seed.fill(0);
                        tracing::warn!(
                            path = %key_path.display(),
                            "persisted identity key is invalid ({e}), regenerating"
                        );
                    }
                },
                Err(_) => tracing::warn!(
                    path = %key_path.display(),
                    "persisted identity key is not 32 bytes, regenerating"
                ),
            }
        }
    }

    let signing_key = SigningKey::generate(&mut OsRng);
    let seed = signing_key.to_bytes();

    persist_identity(&key_path, &seed)?;

    let keypair =
        Keypair::ed25519_from_bytes(seed).context("freshly generated identity key is invalid")?;
    tracing::info!(path = %key_path.display(), "generated new relay identity");
    Ok(keypair)
}

fn persist_identity(path: &Path, seed: &[u8; 32]) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to open {} for writing", path.display()))?;
    use std::io::Write;
    file.write_all(seed)
        .with_context(|| format!("failed to persist identity key to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_persists_a_new_identity() {
        let dir = tempfile::tempdir().unwrap();
        let persist_dir = dir.path().to_str().unwrap();

        let first = load_or_generate(persist_dir, false).unwrap();
        let second = load_or_generate(persist_dir, false).unwrap();

        assert_eq!(first.public(), second.public());
    }

    #[test]
    fn regen_flag_produces_a_different_identity() {
        let dir = tempfile::tempdir().unwrap();
        let persist_dir = dir.path().to_str().unwrap();

        let first = load_or_generate(persist_dir, false).unwrap();
        let second = load_or_generate(persist_dir, true).unwrap();

        assert_ne!(first.public(), second.public());
    }
}
