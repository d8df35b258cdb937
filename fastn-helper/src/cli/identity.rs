//! The daemon's node key

use std::path::{Path, PathBuf};

/// File holding the 32 raw secret key bytes.
pub const KEY_FILE: &str = "helper.key";

/// Prints the peer id other helpers use to reach this one.
pub async fn show_peer_id(fastn_home: PathBuf) -> eyre::Result<()> {
    tokio::fs::create_dir_all(&fastn_home).await?;
    let key = get_or_create_daemon_key(&fastn_home).await?;
    println!("{}", fastn_helper_net::peer_id(&key.public()));
    Ok(())
}

/// Loads the node key from FASTN_HOME, or creates and saves one.
///
/// A key that cannot be saved is still used, the peer id then changes on
/// the next start.
pub async fn get_or_create_daemon_key(fastn_home: &Path) -> eyre::Result<iroh::SecretKey> {
    let key_file = fastn_home.join(KEY_FILE);

    if key_file.exists() {
        match tokio::fs::read(&key_file).await {
            Ok(bytes) => match <[u8; 32]>::try_from(bytes.as_slice()) {
                Ok(bytes) => {
                    tracing::info!("loaded node key from {}", key_file.display());
                    return Ok(iroh::SecretKey::from_bytes(&bytes));
                }
                Err(_) => eprintln!(
                    "⚠️  {} is not a 32 byte key, generating a new one",
                    key_file.display()
                ),
            },
            Err(e) => eprintln!(
                "⚠️  Could not read key from {} ({e}), generating a new one",
                key_file.display()
            ),
        }
    }

    let key = iroh::SecretKey::from_bytes(&rand::random());
    match tokio::fs::write(&key_file, key.to_bytes()).await {
        Ok(()) => eprintln!("🔑 Generated and saved node key to: {}", key_file.display()),
        Err(e) => {
            eprintln!("⚠️  Could not save key to {} ({e})", key_file.display());
            eprintln!("   Using temporary key - peer id will change on restart");
        }
    }
    Ok(key)
}
