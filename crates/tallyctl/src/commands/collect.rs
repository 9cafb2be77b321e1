use std::io::Write;
use std::path::Path;

use tally_core::{MetricRegistry, TallyConfig};
use tally_engine::Tally;
use tracing::info;

pub fn collect(
    config: TallyConfig,
    registry: &Path,
    ping: &str,
    peek: bool,
    pretty: bool,
) -> anyhow::Result<()> {
    if config.data_dir.is_none() {
        anyhow::bail!("no data directory: pass --data-dir or set data_dir in the config file");
    }
    let registry = MetricRegistry::from_file(registry)?;
    let tally = Tally::init(config, registry);

    let result = write_snapshot(&mut std::io::stdout().lock(), &tally, ping, peek, pretty);
    // Clearing a collected ping must reach disk before the process exits.
    tally.shutdown();
    result
}

/// Print the snapshot for `ping`. Prints nothing when the ping is empty.
pub fn write_snapshot(
    out: &mut impl Write,
    tally: &Tally,
    ping: &str,
    peek: bool,
    pretty: bool,
) -> anyhow::Result<()> {
    let snapshot = if peek { tally.peek(ping) } else { tally.collect(ping) };
    let Some(snapshot) = snapshot else {
        info!(%ping, "nothing to send");
        return Ok(());
    };

    let doc = snapshot.to_json();
    if pretty {
        writeln!(out, "{}", serde_json::to_string_pretty(&doc)?)?;
    } else {
        writeln!(out, "{doc}")?;
    }
    info!(%ping, metrics = snapshot.len(), peek, "ping assembled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{CommonMetricData, MetricType, MetricValue};

    fn tally() -> (Tally, CommonMetricData) {
        let launches = CommonMetricData::new("app", "launches", MetricType::Counter);
        let registry = MetricRegistry::new().with_metric(launches.clone()).unwrap();
        (Tally::in_memory(registry), launches)
    }

    #[test]
    fn writes_one_document_and_clears() {
        let (tally, launches) = tally();
        tally.record(&launches, MetricValue::Counter(2));

        let mut out = Vec::new();
        write_snapshot(&mut out, &tally, "metrics", false, false).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(doc, serde_json::json!({ "counter": { "app.launches": 2 } }));

        let mut out = Vec::new();
        write_snapshot(&mut out, &tally, "metrics", false, false).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn peek_leaves_values_in_place() {
        let (tally, launches) = tally();
        tally.record(&launches, MetricValue::Counter(1));

        let mut out = Vec::new();
        write_snapshot(&mut out, &tally, "metrics", true, true).unwrap();
        assert!(!out.is_empty());
        assert!(tally.peek("metrics").is_some());
    }

    #[test]
    fn requires_a_data_dir() {
        let err = collect(TallyConfig::in_memory(), Path::new("unused.toml"), "metrics", false, false)
            .unwrap_err();
        assert!(err.to_string().contains("data directory"));
    }
}
