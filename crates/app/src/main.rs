use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use fire_agent::agent::{
    ChannelTransport, Collaborators, HttpActuator, pipeline, telemetry,
    config::{AgentCliArgs, AgentConfig},
};
use ml_core::Classifier;
use tracing::{info, warn};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config: AgentConfig = AgentCliArgs::parse().try_into()?;
    let _telemetry = telemetry::init(config.verbose, config.chrome_trace.as_deref());
    if let Some(addr) = config.metrics_addr {
        telemetry::init_metrics(addr)?;
    }

    let actuator = HttpActuator::new(
        config.actuation.url.clone(),
        config.actuation.request_timeout,
    )?;
    let parts = Collaborators {
        opener: camera_opener(),
        classifier: load_classifier(&config),
        actuator,
        transport: channel_transport(&config),
    };

    let report = pipeline::run(config, parts)?;
    info!(
        "Shutdown complete: {} frames, {} faults",
        report.frames, report.faults
    );
    Ok(())
}

#[cfg(feature = "opencv")]
fn camera_opener() -> video_ingest::OpenCvOpener {
    video_ingest::OpenCvOpener
}

#[cfg(not(feature = "opencv"))]
fn camera_opener() -> video_ingest::UnavailableOpener {
    warn!("Built without the `opencv` feature; no camera can be opened");
    video_ingest::UnavailableOpener
}

#[cfg(feature = "with-tch")]
fn load_classifier(config: &AgentConfig) -> Option<Box<dyn Classifier>> {
    use ml_core::{detector::Detector, tch::Device};

    let path = config.inference.model_path.as_ref()?;
    let size = config.inference.detector_size;
    match Detector::new(
        path,
        Device::cuda_if_available(),
        (size, size),
        config.inference.labels.clone(),
    ) {
        Ok(detector) => {
            info!(
                "Detector loaded from {} on {:?}",
                path.display(),
                detector.device()
            );
            Some(Box::new(detector))
        }
        Err(err) => {
            warn!("Failed to load detector from {}: {err:#}", path.display());
            None
        }
    }
}

#[cfg(not(feature = "with-tch"))]
fn load_classifier(config: &AgentConfig) -> Option<Box<dyn Classifier>> {
    if config.inference.model_path.is_some() {
        warn!("Built without the `with-tch` feature; ignoring --model");
    }
    None
}

#[cfg(feature = "socketio")]
fn channel_transport(config: &AgentConfig) -> Option<Arc<dyn ChannelTransport>> {
    let url = config.server_url.as_ref()?;
    let transport: Arc<dyn ChannelTransport> =
        Arc::new(fire_agent::agent::SocketIoTransport::new(url.clone()));
    Some(transport)
}

#[cfg(not(feature = "socketio"))]
fn channel_transport(config: &AgentConfig) -> Option<Arc<dyn ChannelTransport>> {
    if config.server_url.is_some() {
        warn!("Built without the `socketio` feature; running standalone");
    }
    None
}
