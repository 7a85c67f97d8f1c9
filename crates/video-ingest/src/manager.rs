//! Camera lifecycle: probing (index, backend) pairs, best-effort
//! configuration, sequenced reads, and reinitialization after sustained read
//! failures.

use std::{
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{
    camera::{CameraDevice, CameraOpener},
    types::{Backend, CameraProperty, CaptureError, Frame},
};

/// Requested capture configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraSettings {
    pub width: i32,
    pub height: i32,
    pub fps: f64,
    /// Highest device index probed (inclusive).
    pub max_index: i32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30.0,
            max_index: 4,
        }
    }
}

/// How many consecutive read failures trigger a reinitialize, and how long
/// to wait between releasing and re-probing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReinitPolicy {
    pub failure_threshold: u32,
    pub delay: Duration,
}

impl Default for ReinitPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            delay: Duration::from_secs(1),
        }
    }
}

/// Description of the device currently held open.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraInfo {
    pub index: i32,
    pub backend: Backend,
    /// Values read back after configuration; `None` if the driver would not say.
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub fps: Option<f64>,
}

/// Result of [`CameraManager::initialize`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum InitOutcome {
    Ready(CameraInfo),
    Degraded,
}

impl InitOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, InitOutcome::Ready(_))
    }
}

/// Result of reporting a failed read to the manager.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FailureOutcome {
    /// Below threshold; carries the current consecutive failure count.
    Counted(u32),
    /// Threshold crossed; one reinitialize attempt was made.
    Reinitialized(InitOutcome),
}

struct ActiveCamera<D> {
    device: D,
    info: CameraInfo,
}

/// Owns the camera handle. Lives on the capture thread only.
pub struct CameraManager<O: CameraOpener> {
    opener: O,
    settings: CameraSettings,
    policy: ReinitPolicy,
    active: Option<ActiveCamera<O::Device>>,
    consecutive_failures: u32,
    sequence: u64,
    reinit_attempts: u64,
}

impl<O: CameraOpener> CameraManager<O> {
    pub fn new(opener: O, settings: CameraSettings, policy: ReinitPolicy) -> Self {
        Self {
            opener,
            settings,
            policy,
            active: None,
            consecutive_failures: 0,
            sequence: 0,
            reinit_attempts: 0,
        }
    }

    /// Try every (index, backend) pair and keep the first one that opens and
    /// yields a non-empty frame. Failed attempts are released before moving on.
    pub fn probe(&mut self) -> Result<(O::Device, i32, Backend), CaptureError> {
        let backends = self.opener.backends();
        let mut attempts = 0usize;
        for index in 0..=self.settings.max_index {
            for &backend in &backends {
                attempts += 1;
                debug!("Probing camera #{index} with backend {backend}");
                let mut device = match self.opener.open(index, backend) {
                    Ok(device) => device,
                    Err(err) => {
                        debug!("Camera #{index} ({backend}) did not open: {err}");
                        continue;
                    }
                };
                match device.read() {
                    Ok(image) if !image.is_empty() => {
                        info!(
                            "Camera found at index {index} ({backend}, {}x{})",
                            image.width, image.height
                        );
                        return Ok((device, index, backend));
                    }
                    Ok(_) => debug!("Camera #{index} ({backend}) returned an empty frame"),
                    Err(err) => debug!("Camera #{index} ({backend}) read failed: {err}"),
                }
                device.release();
            }
        }
        Err(CaptureError::NotFound { attempts })
    }

    /// Probe and configure. Never fails: a missing camera yields
    /// [`InitOutcome::Degraded`].
    pub fn initialize(&mut self) -> InitOutcome {
        self.release();
        let (mut device, index, backend) = match self.probe() {
            Ok(found) => found,
            Err(err) => {
                warn!("{err}; running without a camera");
                return InitOutcome::Degraded;
            }
        };

        let settings = self.settings;
        let requested = [
            (CameraProperty::FrameWidth, settings.width as f64),
            (CameraProperty::FrameHeight, settings.height as f64),
            (CameraProperty::Fps, settings.fps),
            (CameraProperty::BufferSize, 1.0),
            (CameraProperty::Autofocus, 0.0),
        ];
        for (property, value) in requested {
            match device.set(property, value) {
                Ok(true) => {}
                Ok(false) => debug!("Camera ignored {} = {value}", property.label()),
                Err(err) => warn!("Failed to set camera {}: {err}", property.label()),
            }
        }

        let info = CameraInfo {
            index,
            backend,
            width: device.get(CameraProperty::FrameWidth).ok(),
            height: device.get(CameraProperty::FrameHeight).ok(),
            fps: device.get(CameraProperty::Fps).ok(),
        };
        info!(
            "Camera initialised (index={}, backend={}, resolution={}x{}, fps={})",
            info.index,
            info.backend,
            fmt_reading(info.width),
            fmt_reading(info.height),
            fmt_reading(info.fps)
        );
        self.active = Some(ActiveCamera { device, info });
        InitOutcome::Ready(info)
    }

    /// Release, wait the policy delay, initialize again.
    pub fn reinitialize(&mut self) -> InitOutcome {
        self.reinit_attempts = self.reinit_attempts.saturating_add(1);
        self.release();
        if !self.policy.delay.is_zero() {
            thread::sleep(self.policy.delay);
        }
        self.initialize()
    }

    /// Read the next frame, assigning it the next sequence number.
    ///
    /// Does not touch the failure counter; callers report the outcome through
    /// [`record_success`](Self::record_success) /
    /// [`record_failure`](Self::record_failure).
    pub fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let active = self.active.as_mut().ok_or(CaptureError::NotOpen)?;
        let image = active.device.read()?;
        if image.is_empty() {
            return Err(CaptureError::EmptyFrame);
        }
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Frame {
            data: image.data,
            width: image.width,
            height: image.height,
            format: image.format,
            sequence: self.sequence,
            timestamp_ms: Utc::now().timestamp_millis(),
            captured_at: Instant::now(),
        })
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Count a failed read; on reaching the threshold make exactly one
    /// reinitialize attempt and reset the counter.
    pub fn record_failure(&mut self) -> FailureOutcome {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures < self.policy.failure_threshold.max(1) {
            return FailureOutcome::Counted(self.consecutive_failures);
        }
        warn!(
            "Too many frame errors ({}), reinitialising camera",
            self.consecutive_failures
        );
        let outcome = self.reinitialize();
        self.consecutive_failures = 0;
        FailureOutcome::Reinitialized(outcome)
    }

    pub fn release(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.device.release();
            debug!(
                "Released camera #{} ({})",
                active.info.index, active.info.backend
            );
        }
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    pub fn info(&self) -> Option<CameraInfo> {
        self.active.as_ref().map(|active| active.info)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn reinit_attempts(&self) -> u64 {
        self.reinit_attempts
    }
}

impl<O: CameraOpener> Drop for CameraManager<O> {
    fn drop(&mut self) {
        self.release();
    }
}

fn fmt_reading(value: Option<f64>) -> String {
    value
        .map(|v| format!("{}", v as i64))
        .unwrap_or_else(|| "?".to_string())
}
