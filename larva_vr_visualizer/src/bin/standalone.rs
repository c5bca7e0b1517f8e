use anyhow::Context;
use larva_vr::config::RunConfig;
use larva_vr::ipc::control::StopEvent;
use larva_vr::logging::init_logging;
use larva_vr::session::DEFAULT_STOP_DEADLINE;
use larva_vr::Session;
use larva_vr_visualizer::{ControlHandle, FrameBus, ServerConfig, start_server};
use std::path::PathBuf;

/// Runs a session from `LARVA_VR_CONFIG` (or defaults) and serves its live
/// preview until Ctrl-C.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let bind = std::env::var("LARVA_VR_BIND").unwrap_or_else(|_| "127.0.0.1:3001".to_string());
    let output = std::env::var_os("LARVA_VR_OUTPUT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("runs").join("visualizer"));

    let mut config = RunConfig::resolve(None).context("loading configuration")?;
    let _guard = init_logging(&config.logging, None)?;
    if !config.display.enabled {
        tracing::warn!("display was disabled in the configuration; enabling it for the visualizer");
        config.display.enabled = true;
    }

    let bus = FrameBus::new(2);
    let sink = bus.sink();
    let running = tokio::task::spawn_blocking(move || Session::new(config, output).with_display_sink(Box::new(sink)).start())
        .await
        .context("session start panicked")??;
    let control = ControlHandle::new(running.control().clone());
    let (addr, server) = start_server(bus, ServerConfig { bind_addr: bind }, Some(control)).await?;
    println!("larva_vr preview on http://{addr}");

    let interrupt = StopEvent::new();
    let on_signal = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.set();
        }
    });

    let summary = tokio::task::spawn_blocking(move || {
        let reason = running.wait(None, &interrupt);
        running.stop(DEFAULT_STOP_DEADLINE, reason)
    })
    .await
    .context("session stop panicked")??;
    server.abort();

    println!(
        "run {} ({:?}); metadata in {}",
        summary.output_dir.display(),
        summary.reason,
        summary.metadata_path.display()
    );
    Ok(())
}
