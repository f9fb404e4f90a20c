//! Media-artifact naming.
//!
//! Every derived file is named from the base clip path, so the trim engine,
//! the pull pipeline and retention all agree without storing the names:
//!
//! | artifact                | for `dir/clip.mp4`          |
//! |-------------------------|-----------------------------|
//! | backup of original      | `dir/clip.original.mp4`     |
//! | center-frame image      | `dir/clip_center.jpg`       |
//! | trimmed-video thumbnail | `dir/clip.thumb.jpg`        |
//! | center-frame thumbnail  | `dir/clip_center.thumb.jpg` |
//! | in-flight trim output   | `dir/clip.trimming.mp4`     |

use std::path::{Path, PathBuf};

/// Thumbnail size (width, height).
pub const THUMB_SIZE: (u32, u32) = (160, 90);

/// JPEG quality used for thumbnails.
pub const THUMB_QUALITY: u8 = 70;

fn stem_and_ext(path: &Path) -> (String, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    (stem, ext)
}

fn sibling(path: &Path, name: String) -> PathBuf {
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// `clip.mp4` → `clip.original.mp4`
pub fn backup_path(path: &Path) -> PathBuf {
    let (stem, ext) = stem_and_ext(path);
    sibling(path, format!("{stem}.original.{ext}"))
}

/// `clip.mp4` → `clip.trimming.mp4`
pub fn trim_temp_path(path: &Path) -> PathBuf {
    let (stem, ext) = stem_and_ext(path);
    sibling(path, format!("{stem}.trimming.{ext}"))
}

/// `clip.mp4` → `clip_center.jpg`
pub fn center_frame_path(path: &Path) -> PathBuf {
    let (stem, _) = stem_and_ext(path);
    sibling(path, format!("{stem}_center.jpg"))
}

/// `clip.mp4` → `clip.thumb.jpg`, `clip_center.jpg` → `clip_center.thumb.jpg`
pub fn thumbnail_path(path: &Path) -> PathBuf {
    let (stem, _) = stem_and_ext(path);
    sibling(path, format!("{stem}.thumb.jpg"))
}

/// Every file that may have been derived from `path` (not including
/// `path` itself).
pub fn derived_artifacts(path: &Path) -> Vec<PathBuf> {
    let center = center_frame_path(path);
    vec![
        backup_path(path),
        thumbnail_path(path),
        thumbnail_path(&center),
        center,
        trim_temp_path(path),
    ]
}

/// Path of `path` relative to `base`, with `/` separators.  Falls back to
/// the full path when `path` is outside `base`.
pub fn relative_to(base: &Path, path: &Path) -> String {
    match path.strip_prefix(base) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path.to_string_lossy().into_owned(),
    }
}

/// Whether `path` is a derived artifact rather than a primary media file.
pub fn is_derived(path: &Path) -> bool {
    let name = match path.file_name() {
        Some(n) => n.to_string_lossy(),
        None => return false,
    };
    name.ends_with(".thumb.jpg")
        || name.ends_with("_center.jpg")
        || name.contains(".original.")
        || name.contains(".trimming.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_names() {
        let clip = Path::new("/media/ABC123/clip.mp4");
        assert_eq!(backup_path(clip), PathBuf::from("/media/ABC123/clip.original.mp4"));
        assert_eq!(center_frame_path(clip), PathBuf::from("/media/ABC123/clip_center.jpg"));
        assert_eq!(thumbnail_path(clip), PathBuf::from("/media/ABC123/clip.thumb.jpg"));
        assert_eq!(
            thumbnail_path(&center_frame_path(clip)),
            PathBuf::from("/media/ABC123/clip_center.thumb.jpg")
        );
        assert_eq!(trim_temp_path(clip), PathBuf::from("/media/ABC123/clip.trimming.mp4"));
    }

    #[test]
    fn test_protect_style_name() {
        let clip = Path::new("d/Front (a1b2) - 2025-05-26 - 12.00.00+0200.mp4");
        assert_eq!(
            center_frame_path(clip),
            PathBuf::from("d/Front (a1b2) - 2025-05-26 - 12.00.00+0200_center.jpg")
        );
    }

    #[test]
    fn test_derived_artifacts() {
        let all = derived_artifacts(Path::new("x/clip.mp4"));
        assert_eq!(all.len(), 5);
        assert!(all.iter().all(|p| is_derived(p)));
        assert!(!is_derived(Path::new("x/clip.mp4")));
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(
            relative_to(Path::new("/media"), Path::new("/media/ABC123/clip.mp4")),
            "ABC123/clip.mp4"
        );
        assert_eq!(
            relative_to(Path::new("/other"), Path::new("/media/x.mp4")),
            "/media/x.mp4"
        );
    }
}
