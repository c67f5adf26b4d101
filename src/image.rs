use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Load a raw firmware image (`.bin`) into memory
pub fn load_image(path: impl AsRef<Path>) -> Result<Arc<[u8]>> {
    let path = path.as_ref();
    let data = std::fs::read(path).with_context(|| format!("Failed to read firmware image `{}`", path.display()))?;
    anyhow::ensure!(!data.is_empty(), "Firmware image `{}` is empty", path.display());
    anyhow::ensure!(
        u32::try_from(data.len()).is_ok(),
        "Firmware image `{}` is too large ({} bytes)",
        path.display(),
        data.len()
    );
    Ok(data.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_image_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1, 2, 3, 4, 5]).unwrap();
        let image = load_image(file.path()).unwrap();
        assert_eq!(&image[..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn empty_or_missing_image_is_an_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = load_image(file.path()).unwrap_err();
        assert!(err.to_string().contains("is empty"));

        let err = load_image("/nonexistent/firmware.bin").unwrap_err();
        assert!(err.to_string().contains("Failed to read firmware image"));
    }
}
