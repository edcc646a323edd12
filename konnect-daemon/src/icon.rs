//! Notification icon preparation.
//!
//! Icons named in admin notification requests are normalised to a small
//! PNG, content-addressed by their MD5 digest and cached on disk so the
//! transfer service can serve them to the peer.

use anyhow::{Context, Result};
use image::ImageFormat;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Longest side of a served icon.
const MAX_ICON_SIZE: u32 = 96;

/// A normalised icon ready to be offered as a payload.
#[derive(Debug, Clone)]
pub struct PreparedIcon {
    pub path: PathBuf,
    pub digest: String,
    pub size: i64,
}

pub struct IconCache {
    dir: PathBuf,
}

impl IconCache {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create icon cache at {:?}", dir))?;
        Ok(Self { dir })
    }

    /// Normalise `source` and return the cached copy. Re-preparing the
    /// same image is a cache hit keyed by content digest.
    pub fn prepare(&self, source: &Path) -> Result<PreparedIcon> {
        let img = image::open(source).with_context(|| format!("unsupported icon {:?}", source))?;
        let img = img.thumbnail(MAX_ICON_SIZE, MAX_ICON_SIZE);

        let mut png = Cursor::new(Vec::new());
        img.write_to(&mut png, ImageFormat::Png)
            .context("failed to encode icon as PNG")?;
        let png = png.into_inner();

        let digest = format!("{:x}", md5::compute(&png));
        let path = self.dir.join(format!("{}.png", digest));

        if !path.exists() {
            std::fs::write(&path, &png)
                .with_context(|| format!("failed to cache icon at {:?}", path))?;
            debug!("Cached icon {:?} as {}", source, digest);
        }

        Ok(PreparedIcon {
            path,
            digest,
            size: png.len() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, ImageBuffer, Rgb};
    use tempfile::TempDir;

    fn sample_image(dir: &Path, width: u32, height: u32) -> PathBuf {
        let path = dir.join("sample.png");
        let img = ImageBuffer::from_fn(width, height, |x, _| Rgb([(x % 256) as u8, 0, 0]));
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_large_icon_is_shrunk() {
        let dir = TempDir::new().unwrap();
        let cache = IconCache::new(dir.path().join("cache")).unwrap();
        let source = sample_image(dir.path(), 512, 256);

        let prepared = cache.prepare(&source).unwrap();
        assert!(prepared.path.exists());
        assert_eq!(prepared.size as usize, std::fs::metadata(&prepared.path).unwrap().len() as usize);

        let stored = image::open(&prepared.path).unwrap();
        assert!(stored.width() <= MAX_ICON_SIZE);
        assert!(stored.height() <= MAX_ICON_SIZE);
    }

    #[test]
    fn test_digest_is_stable() {
        let dir = TempDir::new().unwrap();
        let cache = IconCache::new(dir.path().join("cache")).unwrap();
        let source = sample_image(dir.path(), 64, 64);

        let first = cache.prepare(&source).unwrap();
        let second = cache.prepare(&source).unwrap();
        assert_eq!(first.digest, second.digest);
        assert_eq!(first.path, second.path);
    }

    #[test]
    fn test_missing_icon_fails() {
        let dir = TempDir::new().unwrap();
        let cache = IconCache::new(dir.path().join("cache")).unwrap();
        assert!(cache.prepare(Path::new("/nonexistent.png")).is_err());
    }
}
