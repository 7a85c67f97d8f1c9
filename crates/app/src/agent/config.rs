//! Configuration parsing for the agent.
//!
//! This module owns translation of CLI arguments (and their environment
//! variable fallbacks) into an `AgentConfig` which downstream components use
//! without re-parsing flags.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::Parser;
use video_ingest::{CameraSettings, ReinitPolicy};

/// Settings for the actuation dispatcher.
#[derive(Clone, Debug)]
pub struct ActuationSettings {
    /// Endpoint receiving `fire_area` / `confidence` form posts.
    pub url: String,
    pub request_timeout: Duration,
    pub queue_capacity: usize,
    /// Consecutive failures after which failure logs are suppressed.
    pub error_log_threshold: u32,
    pub dequeue_timeout: Duration,
}

/// Settings for the frame stream dispatcher.
#[derive(Clone, Debug)]
pub struct StreamSettings {
    pub queue_capacity: usize,
    pub jpeg_quality: u8,
    pub error_log_threshold: u32,
    pub dequeue_timeout: Duration,
}

/// Settings for inference.
#[derive(Clone, Debug)]
pub struct InferenceSettings {
    /// TorchScript model; `None` runs the pipeline with detection disabled.
    pub model_path: Option<PathBuf>,
    /// Class names in model output order.
    pub labels: Vec<String>,
    pub target_label: String,
    pub confidence_threshold: f32,
    /// Classify every K-th captured frame.
    pub skip_factor: u32,
    /// Square detector input edge in pixels.
    pub detector_size: i64,
}

/// Canonical configuration shared by every component of the agent.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Control channel server; `None` runs standalone.
    pub server_url: Option<String>,
    pub camera: CameraSettings,
    pub reinit: ReinitPolicy,
    pub inference: InferenceSettings,
    pub actuation: ActuationSettings,
    pub stream: StreamSettings,
    /// Minimum spacing between actuation submissions and detection events.
    pub actuation_interval: Duration,
    /// Minimum spacing between frame submissions to the stream.
    pub frame_interval: Duration,
    /// Sleep while disabled or degraded.
    pub idle_interval: Duration,
    pub drain_timeout: Duration,
    pub join_timeout: Duration,
    pub fps_window: usize,
    pub start_enabled: bool,
    /// Send one zero command at startup to check the actuator is reachable.
    pub probe_actuator: bool,
    pub metrics_addr: Option<SocketAddr>,
    /// Chrome trace output for span timings.
    pub chrome_trace: Option<PathBuf>,
    pub verbose: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: Some("http://localhost:3000".into()),
            camera: CameraSettings::default(),
            reinit: ReinitPolicy::default(),
            inference: InferenceSettings {
                model_path: None,
                labels: vec!["fire".into(), "smoke".into()],
                target_label: "fire".into(),
                confidence_threshold: 0.5,
                skip_factor: 2,
                detector_size: 640,
            },
            actuation: ActuationSettings {
                url: "http://192.168.51.96/api/fire".into(),
                request_timeout: Duration::from_secs(2),
                queue_capacity: 10,
                error_log_threshold: 5,
                dequeue_timeout: Duration::from_millis(200),
            },
            stream: StreamSettings {
                queue_capacity: 2,
                jpeg_quality: 80,
                error_log_threshold: 5,
                dequeue_timeout: Duration::from_millis(200),
            },
            actuation_interval: Duration::from_secs(1),
            frame_interval: Duration::from_millis(100),
            idle_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(2),
            join_timeout: Duration::from_secs(2),
            fps_window: 30,
            start_enabled: false,
            probe_actuator: true,
            metrics_addr: None,
            chrome_trace: None,
            verbose: false,
        }
    }
}

/// Command line of the `fire-agent` binary.
#[derive(Debug, Parser)]
#[command(name = "fire-agent", version, about)]
pub struct AgentCliArgs {
    /// Actuator endpoint receiving detection commands.
    #[arg(long, env = "FIRE_AGENT_ACTUATOR_URL", value_name = "URL")]
    pub actuator_url: Option<String>,
    /// Actuator request timeout in milliseconds.
    #[arg(long, env = "FIRE_AGENT_ACTUATOR_TIMEOUT_MS", default_value_t = 2_000)]
    pub actuator_timeout_ms: u64,
    /// Dashboard server for the control channel.
    #[arg(long, env = "FIRE_AGENT_SERVER_URL", value_name = "URL")]
    pub server_url: Option<String>,
    /// Run without a control channel.
    #[arg(long, action = clap::ArgAction::SetTrue, conflicts_with = "server_url")]
    pub no_channel: bool,

    /// TorchScript model path; detection is disabled without one.
    #[arg(long = "model", env = "FIRE_AGENT_MODEL", value_name = "PATH")]
    pub model_path: Option<PathBuf>,
    /// Class names in model output order.
    #[arg(long, env = "FIRE_AGENT_LABELS", value_delimiter = ',', default_value = "fire,smoke")]
    pub labels: Vec<String>,
    /// Class that drives actuation.
    #[arg(long, env = "FIRE_AGENT_TARGET_LABEL", default_value = "fire")]
    pub target_label: String,
    /// Minimum detection confidence (0-1].
    #[arg(long = "confidence", env = "FIRE_AGENT_CONFIDENCE", default_value_t = 0.5)]
    pub confidence_threshold: f32,
    /// Detector input edge in pixels.
    #[arg(long, default_value_t = 640)]
    pub detector_size: i64,
    /// Classify every K-th frame.
    #[arg(long, env = "FIRE_AGENT_SKIP_FACTOR", default_value_t = 2)]
    pub skip_factor: u32,

    /// Requested capture width.
    #[arg(long, default_value_t = 640)]
    pub width: i32,
    /// Requested capture height.
    #[arg(long, default_value_t = 480)]
    pub height: i32,
    /// Requested capture rate.
    #[arg(long, default_value_t = 30.0)]
    pub fps: f64,
    /// Highest camera index probed.
    #[arg(long, default_value_t = 4)]
    pub max_camera_index: i32,
    /// Consecutive read failures before the camera is reinitialised.
    #[arg(long, default_value_t = 10)]
    pub max_frame_errors: u32,
    /// Pause between releasing and re-probing the camera.
    #[arg(long, default_value_t = 1_000)]
    pub reinit_delay_ms: u64,

    /// Minimum spacing between actuator commands.
    #[arg(long, env = "FIRE_AGENT_ACTUATION_INTERVAL_MS", default_value_t = 1_000)]
    pub actuation_interval_ms: u64,
    /// Minimum spacing between streamed frames.
    #[arg(long, env = "FIRE_AGENT_FRAME_INTERVAL_MS", default_value_t = 100)]
    pub frame_interval_ms: u64,
    /// Actuation queue capacity.
    #[arg(long, default_value_t = 10)]
    pub actuation_queue: usize,
    /// Stream queue capacity.
    #[arg(long, default_value_t = 2)]
    pub stream_queue: usize,
    /// Consecutive delivery failures before logs are suppressed.
    #[arg(long, default_value_t = 5)]
    pub error_log_threshold: u32,
    /// JPEG quality for streamed frames (1-100).
    #[arg(long, env = "FIRE_AGENT_JPEG_QUALITY", default_value_t = 80)]
    pub jpeg_quality: u8,

    /// Sleep while capture is disabled or no camera is present.
    #[arg(long, default_value_t = 100)]
    pub idle_ms: u64,
    /// Worker dequeue timeout, bounds how quickly workers notice shutdown.
    #[arg(long, default_value_t = 200)]
    pub dequeue_timeout_ms: u64,
    /// How long shutdown waits for queues to drain.
    #[arg(long, default_value_t = 2_000)]
    pub drain_timeout_ms: u64,
    /// How long shutdown waits for each worker to exit.
    #[arg(long, default_value_t = 2_000)]
    pub join_timeout_ms: u64,
    /// Frames kept for the FPS estimate.
    #[arg(long, default_value_t = 30)]
    pub fps_window: usize,

    /// Start with capture enabled instead of waiting for a `start` command.
    #[arg(long, env = "FIRE_AGENT_START_ENABLED", action = clap::ArgAction::SetTrue)]
    pub start_enabled: bool,
    /// Skip the startup actuator reachability check.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub no_actuator_probe: bool,
    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "FIRE_AGENT_METRICS_ADDR", value_name = "HOST:PORT")]
    pub metrics_addr: Option<SocketAddr>,
    /// Write span timings to this file in Chrome trace format.
    #[arg(long, value_name = "PATH")]
    pub trace_chrome: Option<PathBuf>,
    /// Debug-level logs for the agent crates.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

impl TryFrom<AgentCliArgs> for AgentConfig {
    type Error = anyhow::Error;

    fn try_from(args: AgentCliArgs) -> Result<Self> {
        let defaults = AgentConfig::default();

        if args.width <= 0 || args.height <= 0 {
            bail!("Capture width and height must be positive integers");
        }
        if !(args.fps > 0.0) {
            bail!("--fps must be positive");
        }
        if args.max_camera_index < 0 {
            bail!("--max-camera-index must not be negative");
        }
        if args.skip_factor == 0 {
            bail!("--skip-factor must be at least 1");
        }
        if !(args.confidence_threshold > 0.0 && args.confidence_threshold <= 1.0) {
            bail!("--confidence must be in (0, 1]");
        }
        if args.detector_size <= 0 || args.detector_size % 32 != 0 {
            bail!("--detector-size must be a positive multiple of 32");
        }
        if args.actuation_queue == 0 || args.stream_queue == 0 {
            bail!("Queue capacities must be at least 1");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if args.max_frame_errors == 0 {
            bail!("--max-frame-errors must be at least 1");
        }
        if args.fps_window < 2 {
            bail!("--fps-window must hold at least 2 frames");
        }

        let labels: Vec<String> = args
            .labels
            .into_iter()
            .map(|label| label.trim().to_string())
            .filter(|label| !label.is_empty())
            .collect();
        if labels.is_empty() {
            bail!("--labels must name at least one class");
        }
        let target_label = args.target_label.trim().to_string();
        if !labels.iter().any(|l| l.eq_ignore_ascii_case(&target_label)) {
            bail!("--target-label {target_label:?} is not one of --labels");
        }

        let server_url = if args.no_channel {
            None
        } else {
            args.server_url.or(defaults.server_url)
        };
        let dequeue_timeout = Duration::from_millis(args.dequeue_timeout_ms.max(1));

        Ok(Self {
            server_url,
            camera: CameraSettings {
                width: args.width,
                height: args.height,
                fps: args.fps,
                max_index: args.max_camera_index,
            },
            reinit: ReinitPolicy {
                failure_threshold: args.max_frame_errors,
                delay: Duration::from_millis(args.reinit_delay_ms),
            },
            inference: InferenceSettings {
                model_path: args.model_path,
                labels,
                target_label,
                confidence_threshold: args.confidence_threshold,
                skip_factor: args.skip_factor,
                detector_size: args.detector_size,
            },
            actuation: ActuationSettings {
                url: args.actuator_url.unwrap_or(defaults.actuation.url),
                request_timeout: Duration::from_millis(args.actuator_timeout_ms),
                queue_capacity: args.actuation_queue,
                error_log_threshold: args.error_log_threshold,
                dequeue_timeout,
            },
            stream: StreamSettings {
                queue_capacity: args.stream_queue,
                jpeg_quality: args.jpeg_quality,
                error_log_threshold: args.error_log_threshold,
                dequeue_timeout,
            },
            actuation_interval: Duration::from_millis(args.actuation_interval_ms),
            frame_interval: Duration::from_millis(args.frame_interval_ms),
            idle_interval: Duration::from_millis(args.idle_ms.max(1)),
            drain_timeout: Duration::from_millis(args.drain_timeout_ms),
            join_timeout: Duration::from_millis(args.join_timeout_ms),
            fps_window: args.fps_window,
            start_enabled: args.start_enabled,
            probe_actuator: !args.no_actuator_probe,
            metrics_addr: args.metrics_addr,
            chrome_trace: args.trace_chrome,
            verbose: args.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Result<AgentConfig> {
        let argv = std::iter::once("fire-agent").chain(extra.iter().copied());
        AgentConfig::try_from(AgentCliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_match_field_settings() {
        let config = parse(&[]).expect("defaults are valid");

        assert_eq!(config.server_url.as_deref(), Some("http://localhost:3000"));
        assert_eq!(config.actuation.url, "http://192.168.51.96/api/fire");
        assert_eq!(config.actuation.queue_capacity, 10);
        assert_eq!(config.stream.queue_capacity, 2);
        assert_eq!(config.actuation_interval, Duration::from_secs(1));
        assert_eq!(config.frame_interval, Duration::from_millis(100));
        assert_eq!(config.inference.confidence_threshold, 0.5);
        assert_eq!(config.inference.target_label, "fire");
        assert_eq!(config.reinit.failure_threshold, 10);
        assert!(!config.start_enabled);
        assert!(config.probe_actuator);
    }

    #[test]
    fn no_channel_runs_standalone() {
        let config = parse(&["--no-channel"]).expect("valid");
        assert!(config.server_url.is_none());
    }

    #[test]
    fn rejects_zero_skip_factor() {
        assert!(parse(&["--skip-factor", "0"]).is_err());
    }

    #[test]
    fn rejects_out_of_range_jpeg_quality() {
        assert!(parse(&["--jpeg-quality", "0"]).is_err());
        assert!(parse(&["--jpeg-quality", "101"]).is_err());
    }

    #[test]
    fn target_label_must_be_known() {
        assert!(parse(&["--labels", "smoke", "--target-label", "fire"]).is_err());
        let config = parse(&["--labels", "Fire, smoke", "--target-label", "fire"]).expect("valid");
        assert_eq!(config.inference.labels, vec!["Fire", "smoke"]);
    }

    #[test]
    fn zero_capacity_queues_are_rejected() {
        assert!(parse(&["--stream-queue", "0"]).is_err());
    }
}
