//! Long-term key storage: load the identity from disk, or generate and save
//! one on first run.

use std::fs;
use std::io;
use std::path::Path;

use grove_core::Identity;
use tracing::info;

const KEY_FILE: &str = "identity.key";

/// Load the raw 32-byte secret scalar from `dir`, generating a fresh key
/// when none exists yet.
pub fn load_or_generate(dir: &Path) -> io::Result<Identity> {
    let path = dir.join(KEY_FILE);
    if path.exists() {
        let bytes = fs::read(&path)?;
        return Identity::from_secret_bytes(&bytes).map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: {err}", path.display()),
            )
        });
    }

    fs::create_dir_all(dir)?;
    let identity = Identity::generate();
    fs::write(&path, identity.secret_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    }
    info!(path = %path.display(), "generated new identity key");
    Ok(identity)
}
