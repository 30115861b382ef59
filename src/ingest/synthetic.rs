//! Synthetic camera for `stub://` device ids.
//!
//! Produces a moving test pattern at the requested resolution. A
//! `SyntheticControl` handle scripts the failures a real camera shows:
//! declined permission, unplugged devices, tracks ending mid-session and
//! tracks that have not reported dimensions yet.

use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{CameraBackend, CameraDevice, CameraError, CameraTrack, Resolution, TrackEvent};
use crate::frame::VideoFrame;

#[derive(Debug, Default)]
struct SyntheticState {
    deny_permission: bool,
    unplugged: HashSet<String>,
    zero_dimensions: bool,
    fail_grabs: bool,
    opens: u32,
    live: u32,
    /// Generation of the newest track; older tracks ignore scripted events.
    generation: u64,
    pending_event: Option<TrackEvent>,
}

fn lock(state: &Mutex<SyntheticState>) -> MutexGuard<'_, SyntheticState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SyntheticCamera {
    devices: Vec<CameraDevice>,
    state: Arc<Mutex<SyntheticState>>,
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticCamera {
    /// Two devices: `stub://front` and `stub://rear`.
    pub fn new() -> Self {
        Self::with_devices(vec![
            CameraDevice {
                id: "stub://front".to_string(),
                label: "Synthetic front camera".to_string(),
            },
            CameraDevice {
                id: "stub://rear".to_string(),
                label: "Synthetic rear camera".to_string(),
            },
        ])
    }

    pub fn with_devices(devices: Vec<CameraDevice>) -> Self {
        Self {
            devices,
            state: Arc::new(Mutex::new(SyntheticState::default())),
        }
    }

    pub fn control(&self) -> SyntheticControl {
        SyntheticControl {
            state: Arc::clone(&self.state),
        }
    }
}

impl CameraBackend for SyntheticCamera {
    type Track = SyntheticTrack;

    fn request_permission(&mut self) -> Result<(), CameraError> {
        if lock(&self.state).deny_permission {
            return Err(CameraError::PermissionDenied);
        }
        Ok(())
    }

    fn devices(&mut self) -> Result<Vec<CameraDevice>, CameraError> {
        let state = lock(&self.state);
        Ok(self
            .devices
            .iter()
            .filter(|device| !state.unplugged.contains(&device.id))
            .cloned()
            .collect())
    }

    fn open(&mut self, device_id: &str, ideal: Resolution) -> Result<SyntheticTrack, CameraError> {
        let mut state = lock(&self.state);
        if state.deny_permission {
            return Err(CameraError::PermissionDenied);
        }
        let known = self.devices.iter().any(|device| device.id == device_id);
        if !known || state.unplugged.contains(device_id) {
            return Err(CameraError::DeviceUnavailable(device_id.to_string()));
        }
        state.opens += 1;
        state.live += 1;
        state.generation += 1;
        state.pending_event = None;
        log::debug!("SyntheticCamera: opened {} at {}", device_id, ideal);
        Ok(SyntheticTrack {
            device_id: device_id.to_string(),
            resolution: ideal,
            generation: state.generation,
            frame_count: 0,
            stopped: false,
            state: Arc::clone(&self.state),
        })
    }
}

/// Scripts failures on a `SyntheticCamera`. Clones share state.
#[derive(Clone, Debug)]
pub struct SyntheticControl {
    state: Arc<Mutex<SyntheticState>>,
}

impl SyntheticControl {
    pub fn deny_permission(&self, deny: bool) {
        lock(&self.state).deny_permission = deny;
    }

    /// Later opens of `device_id` fail; a live track keeps running.
    pub fn unplug(&self, device_id: &str) {
        lock(&self.state).unplugged.insert(device_id.to_string());
    }

    pub fn replug(&self, device_id: &str) {
        lock(&self.state).unplugged.remove(device_id);
    }

    /// End the newest live track.
    pub fn end_track(&self) {
        lock(&self.state).pending_event = Some(TrackEvent::Ended);
    }

    pub fn fail_track(&self, reason: &str) {
        lock(&self.state).pending_event = Some(TrackEvent::Failed(reason.to_string()));
    }

    /// Report `(0, 0)` dimensions, as a track does before its first frame.
    pub fn hold_zero_dimensions(&self, hold: bool) {
        lock(&self.state).zero_dimensions = hold;
    }

    pub fn fail_grabs(&self, fail: bool) {
        lock(&self.state).fail_grabs = fail;
    }

    pub fn open_count(&self) -> u32 {
        lock(&self.state).opens
    }

    pub fn live_tracks(&self) -> u32 {
        lock(&self.state).live
    }
}

pub struct SyntheticTrack {
    device_id: String,
    resolution: Resolution,
    generation: u64,
    frame_count: u64,
    stopped: bool,
    state: Arc<Mutex<SyntheticState>>,
}

impl SyntheticTrack {
    /// Diagonal gradient with a vertical bar that moves one step per frame.
    fn pattern(&self) -> Vec<u8> {
        let Resolution { width, height } = self.resolution;
        let mut rng = rand::thread_rng();
        let bar_width = (width / 16).max(1);
        let bar_x = ((self.frame_count * bar_width as u64) % width.max(1) as u64) as u32;
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            let jitter: u8 = rng.gen_range(0..8);
            for x in 0..width {
                if x >= bar_x && x < bar_x + bar_width {
                    pixels.extend_from_slice(&[240, 240, 240]);
                    continue;
                }
                let r = ((x * 255) / width.max(1)) as u8;
                let g = ((y * 255) / height.max(1)) as u8;
                let b = (((x + y) as u64 + self.frame_count) % 256) as u8;
                pixels.extend_from_slice(&[r.saturating_add(jitter), g, b]);
            }
        }
        pixels
    }
}

impl CameraTrack for SyntheticTrack {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn dimensions(&self) -> (u32, u32) {
        if self.stopped || lock(&self.state).zero_dimensions {
            return (0, 0);
        }
        (self.resolution.width, self.resolution.height)
    }

    fn grab(&mut self) -> Result<VideoFrame, CameraError> {
        if self.stopped {
            return Err(CameraError::TrackEnded);
        }
        {
            let state = lock(&self.state);
            if state.fail_grabs {
                return Err(CameraError::Backend("synthetic grab failure".to_string()));
            }
            if state.zero_dimensions {
                return Err(CameraError::Backend("no frame available yet".to_string()));
            }
        }
        self.frame_count += 1;
        let pixels = self.pattern();
        VideoFrame::from_rgb(pixels, self.resolution.width, self.resolution.height)
            .map_err(|e| CameraError::Backend(e.to_string()))
    }

    fn poll_event(&mut self) -> Option<TrackEvent> {
        let mut state = lock(&self.state);
        if self.stopped || state.generation != self.generation {
            return None;
        }
        state.pending_event.take()
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let mut state = lock(&self.state);
        state.live = state.live.saturating_sub(1);
    }
}

impl Drop for SyntheticTrack {
    fn drop(&mut self) {
        self.stop();
    }
}
