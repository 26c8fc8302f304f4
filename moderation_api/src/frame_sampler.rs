use opencv::{
    core::{Mat, Vector},
    imgcodecs,
    prelude::*,
    videoio,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::instrument;

/// Used when the container does not report a positive frame rate.
pub const DEFAULT_FPS: u64 = 30;

#[derive(Error, Debug)]
pub enum FrameSamplerError {
    #[error("Failed to open video {0:?}")]
    OpenFailed(PathBuf),
    #[error("Frame interval must be at least one second")]
    InvalidInterval,
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(opencv::Error),
    #[error("Failed to write frame {0:?}")]
    WriteFrameFailed(PathBuf),
    #[error("OpenCV error: {0}")]
    OpenCvError(#[from] opencv::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameSample {
    pub timestamp: String,
    pub frame_index: u64,
    pub path: PathBuf,
}

/// Which frame indices get sampled and how their timestamps read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingPlan {
    fps: u64,
    step: u64,
}

impl SamplingPlan {
    pub fn new(reported_fps: f64, interval_secs: u64) -> Result<Self, FrameSamplerError> {
        if interval_secs == 0 {
            return Err(FrameSamplerError::InvalidInterval);
        }

        // Fractional rates are truncated, so 29.97 samples every 29 frames.
        let fps = if reported_fps > 0.0 {
            (reported_fps as u64).max(1)
        } else {
            DEFAULT_FPS
        };

        Ok(Self {
            fps,
            step: interval_secs * fps,
        })
    }

    pub fn fps(&self) -> u64 {
        self.fps
    }

    pub fn is_sample_point(&self, frame_index: u64) -> bool {
        frame_index % self.step == 0
    }

    pub fn timestamp(&self, frame_index: u64) -> String {
        format!("{:.2}", frame_index as f64 / self.fps as f64)
    }
}

/// Decodes `video_path` and writes one JPEG per interval boundary into `output_dir`.
///
/// Blocks for the whole decode, callers on the async runtime should use
/// `spawn_blocking`.
#[instrument(skip(output_dir))]
pub fn sample(
    video_path: &Path,
    interval_secs: u64,
    output_dir: &Path,
) -> Result<Vec<FrameSample>, FrameSamplerError> {
    let mut capture =
        videoio::VideoCapture::from_file(&video_path.to_string_lossy(), videoio::CAP_ANY)?;
    if !capture.is_opened()? {
        return Err(FrameSamplerError::OpenFailed(video_path.to_path_buf()));
    }

    let plan = SamplingPlan::new(capture.get(videoio::CAP_PROP_FPS)?, interval_secs)?;
    tracing::debug!("Sampling every {} frames at {} fps", plan.step, plan.fps());

    let mut samples = Vec::new();
    let mut frame = Mat::default();
    let mut frame_index: u64 = 0;

    loop {
        let grabbed = capture
            .read(&mut frame)
            .map_err(FrameSamplerError::ReadFrameFailed)?;
        if !grabbed || frame.empty() {
            break;
        }

        if plan.is_sample_point(frame_index) {
            let timestamp = plan.timestamp(frame_index);
            let path = output_dir.join(format!("frame_{}.jpg", timestamp));
            if !imgcodecs::imwrite(&path.to_string_lossy(), &frame, &Vector::new())? {
                return Err(FrameSamplerError::WriteFrameFailed(path));
            }
            samples.push(FrameSample {
                timestamp,
                frame_index,
                path,
            });
        }

        frame_index += 1;
    }

    capture.release()?;
    tracing::info!(
        "Sampled {} of {} frames from {:?}",
        samples.len(),
        frame_index,
        video_path
    );

    Ok(samples)
}

#[cfg(test)]
pub(crate) fn write_mjpeg_video(path: &Path, fps: f64, frames: usize) {
    use opencv::core::{Scalar, Size, CV_8UC3};

    let fourcc = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G').unwrap();
    let mut writer = videoio::VideoWriter::new_with_backend(
        &path.to_string_lossy(),
        videoio::CAP_OPENCV_MJPEG,
        fourcc,
        fps,
        Size::new(64, 48),
        true,
    )
    .unwrap();
    assert!(writer.is_opened().unwrap());

    let frame = Mat::new_rows_cols_with_default(48, 64, CV_8UC3, Scalar::all(128.0)).unwrap();
    for _ in 0..frames {
        writer.write(&frame).unwrap();
    }
    writer.release().unwrap();
}
