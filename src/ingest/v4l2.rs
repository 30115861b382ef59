//! V4L2 camera backend.
//!
//! Device nodes come from the v4l context enumeration. Capture uses an mmap
//! stream in RGB3 when the driver accepts it, YUYV otherwise. Capture
//! failures end the track through `poll_event` so `FrameSource` can recover.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::path::Path;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{CameraBackend, CameraDevice, CameraError, CameraTrack, Resolution, TrackEvent};
use crate::frame::VideoFrame;

#[derive(Clone, Debug, Default)]
pub struct V4l2Camera;

impl V4l2Camera {
    pub fn new() -> Self {
        Self
    }
}

impl CameraBackend for V4l2Camera {
    type Track = V4l2Track;

    /// Device node access is governed by filesystem permissions, checked on open.
    fn request_permission(&mut self) -> Result<(), CameraError> {
        Ok(())
    }

    fn devices(&mut self) -> Result<Vec<CameraDevice>, CameraError> {
        Ok(v4l::context::enum_devices()
            .into_iter()
            .map(|node| CameraDevice {
                id: node.path().display().to_string(),
                label: node
                    .name()
                    .unwrap_or_else(|| format!("Video device {}", node.index())),
            })
            .collect())
    }

    fn open(&mut self, device_id: &str, ideal: Resolution) -> Result<V4l2Track, CameraError> {
        if !Path::new(device_id).exists() {
            return Err(CameraError::DeviceUnavailable(device_id.to_string()));
        }
        V4l2Track::open(device_id, ideal).map_err(|err| {
            let permission = err
                .chain()
                .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
                .any(|io| io.kind() == std::io::ErrorKind::PermissionDenied);
            if permission {
                CameraError::PermissionDenied
            } else {
                CameraError::Backend(format!("{err:#}"))
            }
        })
    }
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

pub struct V4l2Track {
    device_id: String,
    state: Option<DeviceState>,
    format: PixelFormat,
    width: u32,
    height: u32,
    frame_count: u64,
    pending_event: Option<TrackEvent>,
}

impl V4l2Track {
    fn open(device_id: &str, ideal: Resolution) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(device_id)
            .with_context(|| format!("open v4l2 device {}", device_id))?;
        let mut requested = device.format().context("read v4l2 format")?;
        requested.width = ideal.width;
        requested.height = ideal.height;
        requested.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&requested) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Camera: failed to set RGB3 on {}: {}",
                    device_id,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "v4l2 device {} delivers unsupported format {}",
                device_id,
                format.fourcc
            )
        })?;

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Camera: opened {} ({}x{} {:?})",
            device_id,
            format.width,
            format.height,
            pixel_format
        );
        Ok(Self {
            device_id: device_id.to_string(),
            state: Some(state),
            format: pixel_format,
            width: format.width,
            height: format.height,
            frame_count: 0,
            pending_event: None,
        })
    }
}

impl CameraTrack for V4l2Track {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn dimensions(&self) -> (u32, u32) {
        if self.state.is_none() {
            return (0, 0);
        }
        (self.width, self.height)
    }

    fn grab(&mut self) -> Result<VideoFrame, CameraError> {
        use v4l::io::traits::CaptureStream;

        let Some(state) = self.state.as_mut() else {
            return Err(CameraError::TrackEnded);
        };
        let (width, height, format) = (self.width, self.height, self.format);
        let captured = state.with_mut(|fields| match fields.stream.next() {
            Ok((buf, _meta)) => normalize_to_rgb(buf, width, height, format),
            Err(err) => Err(anyhow::Error::new(err).context("capture v4l2 frame")),
        });
        match captured {
            Ok(rgb) => {
                self.frame_count += 1;
                VideoFrame::from_rgb(rgb, width, height)
                    .map_err(|err| CameraError::Backend(err.to_string()))
            }
            Err(err) => {
                let reason = format!("{err:#}");
                self.pending_event = Some(TrackEvent::Failed(reason.clone()));
                Err(CameraError::Backend(reason))
            }
        }
    }

    fn poll_event(&mut self) -> Option<TrackEvent> {
        self.pending_event.take()
    }

    fn stop(&mut self) {
        if self.state.take().is_some() {
            log::info!(
                "V4l2Camera: released {} after {} frames",
                self.device_id,
                self.frame_count
            );
        }
    }
}
