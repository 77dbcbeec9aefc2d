//! Router identity
//!
//! Each router has a v4 UUID stored in `<var>/uuid`. It identifies this
//! node in the cascade mesh and is created on first start.

use crate::error::{RouterError, RouterResult};
use std::path::Path;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

/// Load the router UUID, generating and persisting one if absent.
///
/// Returns the UUID and whether it was newly generated.
pub async fn load_or_create_uuid(path: &Path) -> RouterResult<(Uuid, bool)> {
    match fs::read_to_string(path).await {
        Ok(contents) => {
            let uuid = Uuid::parse_str(contents.trim()).map_err(|e| {
                RouterError::ConfigError(format!("Invalid UUID in {}: {}", path.display(), e))
            })?;
            info!("UUID loaded: \"{}\"", uuid);
            Ok((uuid, false))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let uuid = Uuid::new_v4();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(path, format!("{}\n", uuid)).await?;
            info!("UUID generated: \"{}\"", uuid);
            Ok((uuid, true))
        }
        Err(e) => Err(e.into()),
    }
}
