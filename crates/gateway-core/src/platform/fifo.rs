//! Named pipe creation.

use crate::error::{GatewayError, Result};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use tracing::debug;

/// Make sure a FIFO exists at `path`.
///
/// Creates missing parent directories and the FIFO itself (mode 0600). An
/// existing FIFO is left alone; any other kind of file at `path` is an error.
pub fn ensure_fifo(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.file_type().is_fifo() => return Ok(()),
        Ok(_) => {
            return Err(GatewayError::FifoOpen {
                path: path.to_path_buf(),
                message: "path exists and is not a FIFO".to_string(),
                source: None,
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(GatewayError::io_with_path(e, path)),
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| GatewayError::io_with_path(e, parent))?;
    }

    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| GatewayError::FifoOpen {
        path: path.to_path_buf(),
        message: format!("mkfifo failed: {}", e),
        source: Some(std::io::Error::from(e)),
    })?;
    debug!("Created FIFO {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_creates_fifo_and_parents() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fifo").join("commands.fifo");

        ensure_fifo(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());

        // Second call is a no-op.
        ensure_fifo(&path).unwrap();
    }

    #[test]
    fn test_rejects_regular_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("results.fifo");
        std::fs::write(&path, "").unwrap();

        assert!(matches!(
            ensure_fifo(&path),
            Err(GatewayError::FifoOpen { .. })
        ));
    }
}
