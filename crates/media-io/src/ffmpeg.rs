use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use image::RgbImage;
use serde::Deserialize;

use crate::{FrameSink, FrameSource, MediaError, VideoInfo};

const CODEC: &str = "mpeg4";

#[derive(Debug, Deserialize)]
struct StreamReport {
    #[serde(default)]
    streams: Vec<StreamEntry>,
    format: Option<FormatEntry>,
}

#[derive(Debug, Deserialize)]
struct StreamEntry {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FormatEntry {
    duration: Option<String>,
}

fn tool(name: &'static str) -> Result<PathBuf, MediaError> {
    which::which(name).map_err(|_| MediaError::ToolMissing(name))
}

/// Parses an ffprobe rate such as `"30/1"` or `"30000/1001"`.
pub(crate) fn parse_rate(rate: &str) -> Option<f64> {
    let (num, den) = match rate.split_once('/') {
        Some((n, d)) => (n.trim().parse::<f64>().ok()?, d.trim().parse::<f64>().ok()?),
        None => (rate.trim().parse::<f64>().ok()?, 1.0),
    };
    if den == 0.0 || num <= 0.0 { return None; }
    Some(num / den)
}

fn parse_stream_info(path: &Path, json: &str) -> Result<VideoInfo, MediaError> {
    let fail = |reason: String| MediaError::Metadata { path: path.display().to_string(), reason };
    let out: StreamReport = serde_json::from_str(json).map_err(|e| fail(e.to_string()))?;
    let stream = out
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| fail("no video stream".into()))?;
    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(fail("missing frame size".into())),
    };
    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
        .unwrap_or(0.0);
    let duration_secs = stream
        .duration
        .as_deref()
        .or(out.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok());
    let frame_count = stream.nb_frames.as_deref().and_then(|n| n.parse::<u64>().ok());
    Ok(VideoInfo { width, height, fps, frame_count, duration_secs })
}

/// Runs `ffprobe` on the first video stream of `path`.
pub fn read_video_info(path: &Path) -> Result<VideoInfo, MediaError> {
    if !path.exists() {
        return Err(MediaError::Metadata { path: path.display().to_string(), reason: "file not found".into() });
    }
    let output = Command::new(tool("ffprobe")?)
        .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams", "-select_streams", "v:0"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| MediaError::Spawn { tool: "ffprobe", source })?;
    if !output.status.success() {
        return Err(MediaError::Metadata {
            path: path.display().to_string(),
            reason: format!("ffprobe exited with {:?}: {}", output.status.code(), String::from_utf8_lossy(&output.stderr)),
        });
    }
    parse_stream_info(path, &String::from_utf8_lossy(&output.stdout))
}

/// Decodes a file to RGB24 through an `ffmpeg` child process. Seeking
/// restarts the child at the target timestamp.
pub struct FfmpegReader {
    path: PathBuf,
    info: VideoInfo,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    pos: u64,
}

impl FfmpegReader {
    pub fn open(path: &Path) -> Result<Self, MediaError> {
        let info = read_video_info(path)?;
        let mut reader = Self { path: path.to_path_buf(), info, child: None, stdout: None, pos: 0 };
        reader.spawn_at(0)?;
        Ok(reader)
    }

    pub fn path(&self) -> &Path { &self.path }

    fn spawn_at(&mut self, frame: u64) -> Result<(), MediaError> {
        self.stop_child();
        let mut cmd = Command::new(tool("ffmpeg")?);
        cmd.args(["-v", "error", "-nostdin"]);
        if frame > 0 && self.info.fps > 0.0 {
            cmd.arg("-ss").arg(format!("{:.6}", frame as f64 / self.info.fps));
        }
        cmd.arg("-i")
            .arg(&self.path)
            .args(["-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd.spawn().map_err(|source| MediaError::Spawn { tool: "ffmpeg", source })?;
        self.stdout = child.stdout.take();
        self.child = Some(child);
        self.pos = frame;
        tracing::debug!(path = %self.path.display(), frame, "decoder started");
        Ok(())
    }

    fn stop_child(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl FrameSource for FfmpegReader {
    fn info(&self) -> &VideoInfo { &self.info }

    fn read_frame(&mut self) -> Result<Option<RgbImage>, MediaError> {
        let Some(stdout) = self.stdout.as_mut() else { return Ok(None); };
        let mut buf = vec![0u8; self.info.width as usize * self.info.height as usize * 3];
        match stdout.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.stop_child();
                return Ok(None);
            }
            Err(e) => return Err(MediaError::Io(e)),
        }
        let (w, h) = (self.info.width, self.info.height);
        let frame = RgbImage::from_raw(w, h, buf).ok_or(MediaError::Geometry { got_w: w, got_h: h, want_w: w, want_h: h })?;
        self.pos += 1;
        Ok(Some(frame))
    }

    fn seek(&mut self, frame: u64) -> Result<(), MediaError> { self.spawn_at(frame) }

    fn position(&self) -> u64 { self.pos }
}

impl Drop for FfmpegReader {
    fn drop(&mut self) { self.stop_child(); }
}

/// Encodes RGB24 frames piped into an `ffmpeg` child process.
pub struct FfmpegWriter {
    path: PathBuf,
    width: u32,
    height: u32,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    frames: u64,
}

impl FfmpegWriter {
    pub fn create(path: &Path, width: u32, height: u32, fps: f64) -> Result<Self, MediaError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) { std::fs::create_dir_all(dir)?; }
        let fps = if fps > 0.0 { fps } else { 30.0 };
        let mut child = Command::new(tool("ffmpeg")?)
            .args(["-y", "-v", "error", "-f", "rawvideo", "-pix_fmt", "rgb24"])
            .arg("-s")
            .arg(format!("{width}x{height}"))
            .arg("-r")
            .arg(format!("{fps}"))
            .args(["-i", "-", "-c:v", CODEC, "-q:v", "2", "-pix_fmt", "yuv420p"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| MediaError::Spawn { tool: "ffmpeg", source })?;
        let stdin = child.stdin.take();
        Ok(Self { path: path.to_path_buf(), width, height, child: Some(child), stdin, frames: 0 })
    }

    /// Stops the encoder and deletes whatever it wrote so far.
    pub fn abort(mut self) {
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::info!(path = %self.path.display(), frames = self.frames, "removed partial output"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "cannot remove partial output"),
        }
    }
}

impl FrameSink for FfmpegWriter {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<(), MediaError> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(MediaError::Geometry { got_w: frame.width(), got_h: frame.height(), want_w: self.width, want_h: self.height });
        }
        let stdin = self.stdin.as_mut().ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "encoder already finished"))?;
        stdin.write_all(frame.as_raw())?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), MediaError> {
        // closing stdin signals end of input
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            let status = child.wait()?;
            if !status.success() {
                return Err(MediaError::Io(io::Error::new(io::ErrorKind::Other, format!("ffmpeg exited with {:?} writing {}", status.code(), self.path.display()))));
            }
        }
        tracing::info!(path = %self.path.display(), frames = self.frames, "video written");
        Ok(())
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        self.stdin = None;
        if let Some(mut child) = self.child.take() { let _ = child.wait(); }
    }
}
