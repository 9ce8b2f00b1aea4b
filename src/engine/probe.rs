//! Stream inspection through `ffprobe` and concat list preparation.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{EngineError, LocalEngine, MediaRunner};

/// One stream reported by the prober.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct ProbeStream {
    /// `video`, `audio`, `subtitle`, ...
    #[serde(default)]
    pub codec_type: String,
    /// Codec short name.
    #[serde(default)]
    pub codec_name: String,
    /// Frame width for video streams.
    #[serde(default)]
    pub width: Option<u32>,
    /// Frame height for video streams.
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    duration: Option<String>,
}

/// Parsed prober output for a single file.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MediaProbe {
    /// Streams in container order.
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    #[serde(default)]
    format: ProbeFormat,
    #[serde(skip)]
    path: Utf8PathBuf,
}

impl MediaProbe {
    /// Parses prober JSON for `path`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Probe`] when the JSON is malformed.
    pub fn parse(path: &Utf8Path, json: &str) -> Result<Self, EngineError> {
        let mut probe: Self = serde_json::from_str(json).map_err(|err| EngineError::Probe {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        probe.path = path.to_path_buf();
        Ok(probe)
    }

    /// First video stream, if present.
    #[must_use]
    pub fn video(&self) -> Option<&ProbeStream> {
        self.stream_of("video")
    }

    /// First audio stream, if present.
    #[must_use]
    pub fn audio(&self) -> Option<&ProbeStream> {
        self.stream_of("audio")
    }

    fn stream_of(&self, kind: &str) -> Option<&ProbeStream> {
        self.streams.iter().find(|stream| stream.codec_type == kind)
    }

    /// Container duration in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Probe`] when the duration is missing or not a
    /// positive number.
    pub fn duration(&self) -> Result<f64, EngineError> {
        let raw = self.format.duration.as_deref().unwrap_or_default();
        raw.trim()
            .parse::<f64>()
            .ok()
            .filter(|seconds| *seconds > 0.0)
            .ok_or_else(|| EngineError::Probe {
                path: self.path.clone(),
                message: format!("unusable duration '{raw}'"),
            })
    }

    /// Describes why `other` cannot be joined losslessly after `self`.
    #[must_use]
    pub fn incompatibility(&self, other: &Self) -> Option<String> {
        let (first_video, other_video) = (self.video(), other.video());
        let codec = |stream: Option<&ProbeStream>| stream.map(|s| s.codec_name.clone());
        if codec(first_video) != codec(other_video) {
            return Some(format!(
                "{} has video codec {:?}, expected {:?}",
                other.path,
                codec(other_video),
                codec(first_video)
            ));
        }
        let size = |stream: Option<&ProbeStream>| stream.map(|s| (s.width, s.height));
        if size(first_video) != size(other_video) {
            return Some(format!("{} has a different resolution", other.path));
        }
        let (first_audio, other_audio) = (self.audio(), other.audio());
        if codec(first_audio) != codec(other_audio) {
            return Some(format!(
                "{} has audio codec {:?}, expected {:?}",
                other.path,
                codec(other_audio),
                codec(first_audio)
            ));
        }
        None
    }
}

impl<R: MediaRunner> LocalEngine<R> {
    /// Runs the prober on `path`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the prober cannot run, fails, or prints
    /// unparseable output.
    pub async fn probe(
        &self,
        path: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<MediaProbe, EngineError> {
        let args = [
            "-v",
            "error",
            "-show_streams",
            "-show_format",
            "-print_format",
            "json",
        ]
        .into_iter()
        .map(str::to_owned)
        .chain([path.to_string()])
        .collect::<Vec<_>>();
        let output = self.runner.run(&self.binaries.ffprobe, &args, cancel).await?;
        if !output.is_success() {
            return Err(EngineError::Probe {
                path: path.to_path_buf(),
                message: output.stderr.trim().to_owned(),
            });
        }
        MediaProbe::parse(path, &output.stdout)
    }

    pub(super) async fn check_concat_compatible(
        &self,
        inputs: &[Utf8PathBuf],
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut reference: Option<MediaProbe> = None;
        for input in inputs {
            let probe = self.probe(input, cancel).await?;
            match &reference {
                None => reference = Some(probe),
                Some(first) => {
                    if let Some(reason) = first.incompatibility(&probe) {
                        return Err(EngineError::Incompatible(reason));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Writes a concat demuxer list for `inputs` into the temp directory.
pub(super) async fn write_concat_list(inputs: &[Utf8PathBuf]) -> Result<Utf8PathBuf, EngineError> {
    let mut body = String::new();
    for input in inputs {
        let absolute = absolute_path(input)?;
        body.push_str("file '");
        body.push_str(&absolute.as_str().replace('\'', "'\\''"));
        body.push_str("'\n");
    }

    let temp_dir =
        Utf8PathBuf::from_path_buf(std::env::temp_dir()).map_err(|dir| EngineError::Io {
            path: Utf8PathBuf::from(dir.to_string_lossy().into_owned()),
            message: String::from("temporary directory is not valid UTF-8"),
        })?;
    let list_path = temp_dir.join(format!("mediarelay-concat-{}.txt", uuid::Uuid::new_v4()));
    tokio::fs::write(&list_path, body)
        .await
        .map_err(|err| EngineError::Io {
            path: list_path.clone(),
            message: err.to_string(),
        })?;
    Ok(list_path)
}

fn absolute_path(path: &Utf8Path) -> Result<Utf8PathBuf, EngineError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let io_error = |message: String| EngineError::Io {
        path: path.to_path_buf(),
        message,
    };
    let raw_cwd = std::env::current_dir().map_err(|err| io_error(err.to_string()))?;
    let cwd = Utf8PathBuf::from_path_buf(raw_cwd)
        .map_err(|_| io_error(String::from("working directory is not valid UTF-8")))?;
    Ok(cwd.join(path))
}
