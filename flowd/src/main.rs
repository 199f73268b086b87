use flowd::{
    firefly::FireflyBackend,
    runtime::{Runtime, pipeline::Pipeline, shutdown::ShutdownConfig},
    source::LineSource,
};
use tokio::{
    signal,
    sync::{broadcast, mpsc},
};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{
    EnvFilter,
    fmt::{Layer, format::FmtSpan},
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Runtime { conf } = Runtime::new()?;

    init_tracing(conf.log_level);
    info!(
        event.name = "flowd.starting",
        config_path = ?conf.config_path,
        "starting flowd"
    );

    let shutdown = ShutdownConfig::from(&conf);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (flow_tx, flow_rx) = mpsc::channel(conf.flow_channel_capacity);

    let mut pipeline = Pipeline::new(conf.flow_channel_capacity);
    pipeline.register(Box::new(FireflyBackend::new(conf.firefly.clone())?));
    pipeline.init().await?;

    let running = pipeline.start(&shutdown_tx, flow_rx);
    let mut pipeline_task = tokio::spawn(running.join());

    let source = LineSource::new(conf.source.path.clone());
    let source_task = tokio::spawn(source.run(shutdown_tx.subscribe(), flow_tx));

    tokio::select! {
        report = &mut pipeline_task => {
            debug!(event.name = "flowd.pipeline_drained", report = ?report, "all backends stopped");
        }
        res = signal::ctrl_c() => {
            if let Err(e) = res {
                error!(event.name = "flowd.signal_failed", error.message = %e, "failed to listen for ctrl-c");
            }
            info!(event.name = "flowd.shutdown_requested", "shutting down");
            // No receivers left only means everything already stopped.
            let _ = shutdown_tx.send(());

            match tokio::time::timeout(shutdown.timeout, &mut pipeline_task).await {
                Ok(report) => debug!(event.name = "flowd.pipeline_drained", report = ?report, "all backends stopped"),
                Err(_) => {
                    warn!(
                        event.name = "flowd.shutdown_timeout",
                        timeout = ?shutdown.timeout,
                        "backends did not stop in time, abandoning them"
                    );
                    pipeline_task.abort();
                }
            }
        }
    }

    // Stdin reads cannot be interrupted, so the source is not waited on.
    source_task.abort();
    match source_task.await {
        Ok(Ok(forwarded)) => debug!(event.name = "flowd.source_done", flows.forwarded = forwarded, "flow source finished"),
        Ok(Err(e)) => error!(event.name = "flowd.source_failed", error.message = %e, "flow source failed"),
        Err(_) => {}
    }

    info!(event.name = "flowd.stopped", "flowd stopped");
    Ok(())
}

fn init_tracing(log_level: Level) {
    let mut fmt_layer = Layer::new()
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(std::env::var("NO_COLOR").is_err());

    match log_level {
        Level::DEBUG => fmt_layer = fmt_layer.with_file(true).with_line_number(true),
        Level::TRACE => {
            fmt_layer = fmt_layer
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
        }
        _ => {}
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,flowd={log_level}")));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
