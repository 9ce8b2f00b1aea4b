//! Media-kind classification by file extension.

use camino::Utf8Path;

/// Image extensions accepted as inputs.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
/// Video extensions accepted as inputs.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "avi", "webm", "flv"];
/// Audio extensions accepted as inputs.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "aac", "flac"];

/// Broad category of a media file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MediaKind {
    /// Still image.
    Image,
    /// Video container.
    Video,
    /// Audio-only file.
    Audio,
}

impl MediaKind {
    /// Classifies `path` by its (case-insensitive) extension.
    #[must_use]
    pub fn of(path: &Utf8Path) -> Option<Self> {
        let ext = extension_lowercase(path)?;
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Video)
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Audio)
        } else {
            None
        }
    }

    /// Extensions that belong to this kind.
    #[must_use]
    pub const fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Image => IMAGE_EXTENSIONS,
            Self::Video => VIDEO_EXTENSIONS,
            Self::Audio => AUDIO_EXTENSIONS,
        }
    }
}

/// Returns the lower-cased extension of `path`, if any.
#[must_use]
pub fn extension_lowercase(path: &Utf8Path) -> Option<String> {
    path.extension().map(str::to_ascii_lowercase)
}

/// Returns `true` when `path` looks like a video.
#[must_use]
pub fn is_video(path: &Utf8Path) -> bool {
    MediaKind::of(path) == Some(MediaKind::Video)
}

/// Returns `true` when `path` looks like an image.
#[must_use]
pub fn is_image(path: &Utf8Path) -> bool {
    MediaKind::of(path) == Some(MediaKind::Image)
}

/// Maps an image extension to its MIME type, defaulting to PNG.
#[must_use]
pub fn image_mime(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "image/png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("photo.JPG", Some(MediaKind::Image))]
    #[case("clip.mov", Some(MediaKind::Video))]
    #[case("song.flac", Some(MediaKind::Audio))]
    #[case("notes.txt", None)]
    #[case("no_extension", None)]
    fn classifies_by_extension(#[case] path: &str, #[case] expected: Option<MediaKind>) {
        assert_eq!(MediaKind::of(Utf8Path::new(path)), expected);
    }

    #[test]
    fn mime_defaults_to_png() {
        assert_eq!(image_mime("JPEG"), "image/jpeg");
        assert_eq!(image_mime("tiff"), "image/png");
    }
}
