use anyhow::{Context, Result};
use clap::Parser;
use atspm_core::config::{InputPaths, RunConfig};
use atspm_core::services::loader::{EventSource, LoadRequest, TableSource};
use atspm_core::{cli, FileSink, SignalDataProcessor};

fn load_request(inputs: &InputPaths) -> Result<LoadRequest> {
    let raw_data = EventSource::from_path(&inputs.raw_data)
        .with_context(|| format!("raw data {}", inputs.raw_data.display()))?;
    let detector_config = match &inputs.detector_config {
        Some(path) => TableSource::from_path(path)
            .with_context(|| format!("detector config {}", path.display()))?,
        None => TableSource::Records(Vec::new()),
    };
    let mut request = LoadRequest::new(raw_data, detector_config);
    if let Some(path) = &inputs.unmatched_events {
        request = request.with_unmatched_events(
            EventSource::from_path(path)
                .with_context(|| format!("unmatched events {}", path.display()))?,
        );
    }
    if let Some(path) = &inputs.device_groups {
        request = request.with_device_groups(
            TableSource::from_path(path)
                .with_context(|| format!("device groups {}", path.display()))?,
        );
    }
    Ok(request)
}

fn main() -> Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = RunConfig::from_path(&args.config)
        .with_context(|| format!("failed to read run config {}", args.config.display()))?;
    if let Some(threads) = args.threads {
        config.processor.threads = Some(threads);
    }

    let request = load_request(&config.inputs)?;
    let mut sink = FileSink::new(config.output.clone());
    let mut processor =
        SignalDataProcessor::new(config.processor).context("invalid processor configuration")?;
    let report = processor
        .run(request, &mut sink)
        .context("aggregation run failed")?;

    if let Some(path) = &args.report {
        let body = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, body)
            .with_context(|| format!("failed to write run report {}", path.display()))?;
    }

    let failed: Vec<String> = report.failures().map(|s| s.name.to_string()).collect();
    tracing::info!(
        outputs = sink.written().len(),
        failed = failed.len(),
        duration_ms = report.duration_ms,
        "run complete"
    );
    if args.strict && !failed.is_empty() {
        anyhow::bail!("aggregation steps failed: {}", failed.join(", "));
    }
    Ok(())
}
