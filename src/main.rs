//! autoprobe agent
//!
//! Attaches the configured probe catalog to a running target, then waits
//! for Ctrl-C and releases every handle before exiting.
//!
//! ```bash
//! AUTOPROBE_CONFIG=/etc/autoprobe/agent.json sudo -E autoprobe
//! ```

use autoprobe::telemetry::{init_tracing, shutdown_tracing};
use autoprobe::AgentConfig;
use tracing::error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = AgentConfig::from_env()?;
    init_tracing(&config.service_name, config.otlp_endpoint.as_deref(), &config.log_filter)?;

    let result = run(&config).await;
    if let Err(e) = &result {
        error!(error = %e, "agent failed");
    }

    shutdown_tracing();
    result
}

#[cfg(feature = "ebpf")]
async fn run(config: &AgentConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use autoprobe::ebpf::{AyaBackend, ProbeTarget};
    use autoprobe::{ConfigError, HandleArena, OffsetTable, ProbeAttacher, ProbeCatalog};
    use tracing::{info, warn};

    let missing = |field: &str| ConfigError::Invalid(format!("{} is required", field));
    let object_path = config.object_path.as_ref().ok_or_else(|| missing("object_path"))?;
    let catalog_path = config.catalog_path.as_ref().ok_or_else(|| missing("catalog_path"))?;
    let executable = config.executable.as_ref().ok_or_else(|| missing("executable"))?;

    let catalog = ProbeCatalog::from_json_file(catalog_path)?;
    let offsets = match &config.offsets_path {
        Some(path) => OffsetTable::from_json_file(path)?,
        None => OffsetTable::default(),
    };

    let mut bpf = aya::Bpf::load_file(object_path)?;
    if let Err(e) = aya_log::BpfLogger::init(&mut bpf) {
        // programs built without aya-log have nothing to forward
        warn!(error = %e, "eBPF logger not initialized");
    }

    let arena = HandleArena::new();
    let target = ProbeTarget::new(executable, config.pid);
    let mut attacher = ProbeAttacher::new(AyaBackend::new(&mut bpf), target, arena.clone());

    let report = attacher.attach_all(&catalog, &offsets);
    if let Err(e) = report.into_result(config.attach_policy) {
        arena.release_all();
        return Err(e.into());
    }

    info!(probes = arena.len(), "waiting for events (Ctrl-C to exit)");
    tokio::signal::ctrl_c().await?;

    let released = arena.release_all();
    info!(
        released = released.released,
        failures = released.failures.len(),
        "probes released"
    );
    Ok(())
}

#[cfg(not(feature = "ebpf"))]
async fn run(config: &AgentConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing::warn!(
        service = %config.service(),
        "built without the `ebpf` feature, no probes will be attached"
    );
    Ok(())
}
