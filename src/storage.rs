//! Capture persistence: stack assembly, path planning, and storage sinks.
//!
//! A [`CaptureUnit`]'s frames are assembled into a [`FrameStack`] (a
//! stack-of-2D-frames 3-D array) and written through a [`StackSink`]. The
//! default sink writes an uncompressed multi-page 16-bit TIFF; an HDF5 sink
//! is available behind the `storage_hdf5` feature. Filenames come from the
//! injected [`CapturePathPlanner`], which encodes the acquisition parameters
//! and the primary stage angle. Writers overwrite any existing file at the
//! computed path, so re-running a sweep replaces its captures.

use crate::core::{CaptureUnit, RawFrame};
use crate::error::{AppResult, DrrpError};
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A validated stack of equally-sized 2-D frames, ready for serialization
/// as a 3-D array (depth x height x width).
#[derive(Debug)]
pub struct FrameStack {
    width: u32,
    height: u32,
    planes: Vec<Vec<u16>>,
}

impl FrameStack {
    /// Assemble frames into a stack, validating that every frame has the
    /// same dimensions and a consistent pixel count.
    pub fn from_frames(frames: &[RawFrame]) -> AppResult<Self> {
        let first = frames
            .first()
            .ok_or_else(|| DrrpError::Processing("cannot assemble an empty stack".to_string()))?;

        let mut planes = Vec::with_capacity(frames.len());
        for frame in frames {
            if frame.width != first.width || frame.height != first.height {
                return Err(DrrpError::Processing(format!(
                    "frame {} is {}x{}, expected {}x{}",
                    frame.frame_number, frame.width, frame.height, first.width, first.height
                )));
            }
            if frame.pixels.len() != frame.pixel_count() {
                return Err(DrrpError::Processing(format!(
                    "frame {} carries {} pixels for a {}x{} image",
                    frame.frame_number,
                    frame.pixels.len(),
                    frame.width,
                    frame.height
                )));
            }
            planes.push(frame.pixels.clone());
        }

        Ok(Self {
            width: first.width,
            height: first.height,
            planes,
        })
    }

    /// Frame width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of frames in the stack.
    pub fn depth(&self) -> usize {
        self.planes.len()
    }

    /// The frames, in retrieval order.
    pub fn planes(&self) -> &[Vec<u16>] {
        &self.planes
    }
}

/// Computes capture file paths from the acquisition parameters.
///
/// The filename carries the configured frame rate, the integration time in
/// milliseconds, and the primary stage angle at write time, e.g.
/// `drrp_600_1.5_125.000.tiff`.
#[derive(Clone, Debug)]
pub struct CapturePathPlanner {
    output_dir: PathBuf,
    prefix: String,
    frame_rate_hz: f64,
    exposure: Duration,
    extension: String,
}

impl CapturePathPlanner {
    /// Create a planner writing into `output_dir` with the given naming
    /// parameters.
    pub fn new(
        output_dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        frame_rate_hz: f64,
        exposure: Duration,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            prefix: prefix.into(),
            frame_rate_hz,
            exposure,
            extension: extension.into(),
        }
    }

    /// The directory capture files are written into.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// The path for a capture taken with the primary stage at
    /// `position1_deg`.
    pub fn path_for(&self, position1_deg: f64) -> PathBuf {
        let exposure_ms = self.exposure.as_secs_f64() * 1e3;
        let file = format!(
            "{}_{}_{}_{:.3}.{}",
            self.prefix, self.frame_rate_hz, exposure_ms, position1_deg, self.extension
        );
        self.output_dir.join(file)
    }
}

/// Persistence boundary for completed captures.
///
/// Implementations overwrite any existing file at the computed path.
#[async_trait]
pub trait StackSink: Send + Sync {
    /// Serialize one capture unit; returns the path written.
    async fn write(&mut self, unit: &CaptureUnit) -> Result<PathBuf>;
}

/// In-memory [`StackSink`] recording every unit it is handed. Used by tests
/// and dry runs; clones share the record.
#[derive(Clone, Default)]
pub struct MemorySink {
    written: Arc<Mutex<Vec<CaptureUnit>>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every unit written so far, in order.
    #[allow(clippy::unwrap_used)]
    pub fn written(&self) -> Vec<CaptureUnit> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl StackSink for MemorySink {
    #[allow(clippy::unwrap_used)]
    async fn write(&mut self, unit: &CaptureUnit) -> Result<PathBuf> {
        // Validate exactly like a real writer would before recording.
        let _ = FrameStack::from_frames(&unit.frames)?;
        self.written.lock().unwrap().push(unit.clone());
        Ok(PathBuf::from(format!("memory-capture-{}", unit.step_index)))
    }
}

fn capture_description(unit: &CaptureUnit, planner: &CapturePathPlanner) -> String {
    serde_json::json!({
        "step_index": unit.step_index,
        "position1_deg": unit.position1_deg,
        "position2_deg": unit.position2_deg,
        "frame_rate_hz": planner.frame_rate_hz,
        "exposure_ms": planner.exposure.as_secs_f64() * 1e3,
        "frames": unit.frames.len(),
        "software_version": env!("CARGO_PKG_VERSION"),
        "written_utc": chrono::Utc::now().to_rfc3339(),
    })
    .to_string()
}

// ============================================================================
// TIFF Writer
// ============================================================================

#[cfg(feature = "storage_tiff")]
mod tiff_enabled {
    use super::*;
    use anyhow::Context;
    use std::fs::File;
    use std::io::BufWriter;
    use tiff::encoder::{colortype, TiffEncoder};
    use tiff::tags::Tag;
    use tracing::info;

    /// Multi-page uncompressed 16-bit TIFF writer, one page per frame.
    /// Capture metadata is embedded as JSON in the first page's
    /// ImageDescription tag.
    pub struct TiffStackWriter {
        planner: CapturePathPlanner,
    }

    impl TiffStackWriter {
        /// Create a writer using `planner` for file naming.
        pub fn new(planner: CapturePathPlanner) -> Self {
            Self { planner }
        }
    }

    #[async_trait]
    impl StackSink for TiffStackWriter {
        async fn write(&mut self, unit: &CaptureUnit) -> Result<PathBuf> {
            let stack = FrameStack::from_frames(&unit.frames)?;
            let path = self.planner.path_for(unit.position1_deg);

            std::fs::create_dir_all(self.planner.output_dir()).with_context(|| {
                format!(
                    "Failed to create output directory at {:?}",
                    self.planner.output_dir()
                )
            })?;

            // File::create truncates, so a re-run overwrites the capture.
            let file = File::create(&path)
                .with_context(|| format!("Failed to create capture file at {path:?}"))?;
            let mut encoder = TiffEncoder::new(BufWriter::new(file))?;

            let description = capture_description(unit, &self.planner);
            for (page, plane) in stack.planes().iter().enumerate() {
                let mut image =
                    encoder.new_image::<colortype::Gray16>(stack.width(), stack.height())?;
                if page == 0 {
                    image
                        .encoder()
                        .write_tag(Tag::ImageDescription, description.as_str())?;
                }
                image.write_data(plane)?;
            }

            info!(
                "wrote {} frames to '{}'",
                stack.depth(),
                path.display()
            );
            Ok(path)
        }
    }
}

#[cfg(not(feature = "storage_tiff"))]
mod tiff_disabled {
    use super::*;

    /// Stub writer present when the `storage_tiff` feature is disabled.
    pub struct TiffStackWriter;

    impl TiffStackWriter {
        /// Create the stub; every write reports the missing feature.
        pub fn new(_planner: CapturePathPlanner) -> Self {
            Self
        }
    }

    #[async_trait]
    impl StackSink for TiffStackWriter {
        async fn write(&mut self, _unit: &CaptureUnit) -> Result<PathBuf> {
            Err(DrrpError::FeatureNotEnabled("storage_tiff".to_string()).into())
        }
    }
}

#[cfg(feature = "storage_tiff")]
pub use tiff_enabled::TiffStackWriter;

#[cfg(not(feature = "storage_tiff"))]
pub use tiff_disabled::TiffStackWriter;

// ============================================================================
// HDF5 Writer
// ============================================================================

#[cfg(feature = "storage_hdf5")]
mod hdf5_enabled {
    use super::*;
    use anyhow::Context;
    use ndarray::Array3;
    use tracing::info;

    /// HDF5 writer storing the stack as one 3-D `frames` dataset with the
    /// capture parameters attached as attributes.
    pub struct Hdf5StackWriter {
        planner: CapturePathPlanner,
    }

    impl Hdf5StackWriter {
        /// Create a writer using `planner` for file naming.
        pub fn new(planner: CapturePathPlanner) -> Self {
            Self { planner }
        }
    }

    #[async_trait]
    impl StackSink for Hdf5StackWriter {
        async fn write(&mut self, unit: &CaptureUnit) -> Result<PathBuf> {
            let stack = FrameStack::from_frames(&unit.frames)?;
            let path = self.planner.path_for(unit.position1_deg);

            std::fs::create_dir_all(self.planner.output_dir()).with_context(|| {
                format!(
                    "Failed to create output directory at {:?}",
                    self.planner.output_dir()
                )
            })?;

            let flat: Vec<u16> = stack.planes().concat();
            let array = Array3::from_shape_vec(
                (
                    stack.depth(),
                    stack.height() as usize,
                    stack.width() as usize,
                ),
                flat,
            )
            .map_err(|e| DrrpError::Processing(format!("stack reshaping failed: {e}")))?;

            // hdf5::File::create truncates, matching the overwrite contract.
            let file = hdf5::File::create(&path)
                .with_context(|| format!("Failed to create capture file at {path:?}"))?;
            let dataset = file
                .new_dataset_builder()
                .with_data(array.view())
                .create("frames")?;

            dataset
                .new_attr::<f64>()
                .create("position1_deg")?
                .write_scalar(&unit.position1_deg)?;
            dataset
                .new_attr::<f64>()
                .create("position2_deg")?
                .write_scalar(&unit.position2_deg)?;
            dataset
                .new_attr::<u64>()
                .create("step_index")?
                .write_scalar(&(unit.step_index as u64))?;
            dataset
                .new_attr::<f64>()
                .create("frame_rate_hz")?
                .write_scalar(&self.planner.frame_rate_hz)?;
            dataset
                .new_attr::<f64>()
                .create("exposure_ms")?
                .write_scalar(&(self.planner.exposure.as_secs_f64() * 1e3))?;

            info!("wrote {} frames to '{}'", stack.depth(), path.display());
            Ok(path)
        }
    }
}

#[cfg(not(feature = "storage_hdf5"))]
mod hdf5_disabled {
    use super::*;

    /// Stub writer present when the `storage_hdf5` feature is disabled.
    pub struct Hdf5StackWriter;

    impl Hdf5StackWriter {
        /// Create the stub; every write reports the missing feature.
        pub fn new(_planner: CapturePathPlanner) -> Self {
            Self
        }
    }

    #[async_trait]
    impl StackSink for Hdf5StackWriter {
        async fn write(&mut self, _unit: &CaptureUnit) -> Result<PathBuf> {
            Err(DrrpError::FeatureNotEnabled("storage_hdf5".to_string()).into())
        }
    }
}

#[cfg(feature = "storage_hdf5")]
pub use hdf5_enabled::Hdf5StackWriter;

#[cfg(not(feature = "storage_hdf5"))]
pub use hdf5_disabled::Hdf5StackWriter;
