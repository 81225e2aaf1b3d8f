use super::{
    MetricDesc,
    Sample,
};
use eyre::{
    Context as _,
    Result,
};
use prometheus::{
    proto::MetricFamily,
    Encoder as _,
    GaugeVec,
    Opts,
    Registry,
    TextEncoder,
};
use std::collections::HashMap;

/// Turns one scrape's samples into Prometheus metric families.
///
/// A throwaway registry is built per call so nothing outlives the scrape.
/// Descriptors without samples produce no family, samples whose kind is not
/// in `descs` are dropped.
pub fn metric_families(descs: &[MetricDesc], samples: &[Sample]) -> Result<Vec<MetricFamily>> {
    let registry = Registry::new();
    let mut gauges = HashMap::new();

    for desc in descs {
        let gauge = GaugeVec::new(Opts::new(desc.fq_name.clone(), desc.help), desc.labels)
            .with_context(|| format!("Invalid metric descriptor {}", desc.fq_name))?;
        registry
            .register(Box::new(gauge.clone()))
            .with_context(|| format!("Failed to register {}", desc.fq_name))?;
        gauges.insert(desc.kind, gauge);
    }

    for sample in samples {
        let Some(gauge) = gauges.get(&sample.kind) else {
            warn!(metric = %sample.kind.fq_name(), "dropping sample outside of the catalog");
            continue;
        };
        let values = sample.label_values.iter().map(String::as_str).collect::<Vec<_>>();
        gauge
            .get_metric_with_label_values(values.as_slice())
            .with_context(|| format!("Label mismatch for {}", sample.kind.fq_name()))?
            .set(sample.value);
    }

    Ok(registry.gather())
}

/// Encodes metric families in the Prometheus text exposition format.
pub fn encode_text(families: &[MetricFamily]) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(families, &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Encoded metrics are not valid UTF-8")
}
