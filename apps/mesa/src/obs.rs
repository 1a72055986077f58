use clap::ValueEnum;
use std::net::SocketAddr;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Installs the global subscriber. `MESA_LOG` takes precedence over `default_level`.
pub fn init_tracing(default_level: &str, format: LogFormat) -> Result<(), String> {
    let filter = std::env::var("MESA_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default_level.to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_new(filter)
        .map_err(|err| format!("invalid log filter: {err}"))?;

    // stdout carries the JSON result line.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => builder
            .try_init()
            .map_err(|err| format!("failed to init tracing: {err}")),
        LogFormat::Json => builder
            .json()
            .with_current_span(true)
            .try_init()
            .map_err(|err| format!("failed to init tracing: {err}")),
    }
}

fn resolve_metrics_addr(flag: Option<&str>) -> Result<Option<SocketAddr>, String> {
    let raw = match flag {
        Some(raw) => raw.to_string(),
        None => match std::env::var("MESA_METRICS_ADDR") {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        },
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|err| format!("invalid metrics address (expected host:port): {err}"))
}

#[cfg(feature = "prometheus")]
pub fn init_metrics(flag: Option<&str>) -> Result<Option<SocketAddr>, String> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let Some(addr) = resolve_metrics_addr(flag)? else {
        return Ok(None);
    };
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|err| format!("failed to install prometheus exporter: {err}"))?;

    tracing::info!(metrics_addr = %addr, "prometheus metrics exporter enabled");
    Ok(Some(addr))
}

#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(flag: Option<&str>) -> Result<Option<SocketAddr>, String> {
    if let Some(addr) = resolve_metrics_addr(flag)? {
        tracing::warn!(metrics_addr = %addr, "built without the prometheus feature; metrics not exported");
    }
    Ok(None)
}
