use crate::reporting;
use mesa_domain::repositories::artifacts::ArtifactWriter;
use mesa_domain::value_objects::trade::ClosedTrade;
use std::fs;
use std::path::Path;
use std::time::Instant;

#[derive(Debug, Default, Clone, Copy)]
pub struct FilesystemArtifactWriter;

impl FilesystemArtifactWriter {
    pub fn new() -> Self {
        Self
    }
}

fn record_write_metrics(kind: &'static str, start: Instant, result: &Result<(), String>) {
    let result_label = if result.is_ok() { "ok" } else { "err" };
    metrics::counter!(
        "mesa.infra.artifacts.write.calls_total",
        "kind" => kind,
        "result" => result_label
    )
    .increment(1);
    metrics::histogram!("mesa.infra.artifacts.write_ms", "kind" => kind, "result" => result_label)
        .record(start.elapsed().as_millis() as f64);
}

impl ArtifactWriter for FilesystemArtifactWriter {
    fn ensure_dir(&self, path: &Path) -> Result<(), String> {
        let start = Instant::now();
        let result = fs::create_dir_all(path)
            .map_err(|err| format!("failed to create dir {}: {}", path.display(), err));
        record_write_metrics("ensure_dir", start, &result);
        result
    }

    fn write_trades_csv(&self, path: &Path, trades: &[ClosedTrade]) -> Result<(), String> {
        let start = Instant::now();
        let result = reporting::write_trades_csv(path, trades);
        record_write_metrics("trades_csv", start, &result);
        result
    }

    fn write_summary_json(&self, path: &Path, summary: &serde_json::Value) -> Result<(), String> {
        let start = Instant::now();
        let result = reporting::write_summary_json(path, summary);
        record_write_metrics("summary_json", start, &result);
        result
    }

    fn write_config_snapshot_toml(&self, path: &Path, contents: &str) -> Result<(), String> {
        let start = Instant::now();
        let result = fs::write(path, contents).map_err(|err| {
            format!(
                "failed to write config snapshot {}: {}",
                path.display(),
                err
            )
        });
        record_write_metrics("config_snapshot_toml", start, &result);
        result
    }
}
