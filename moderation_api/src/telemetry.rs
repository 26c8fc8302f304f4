use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    request_counter: Counter<u64>,
    detection_duration: Histogram<u64>,
    flagged_counter: Counter<u64>,
    frames_sampled: Counter<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("moderation_api");
        global::set_meter_provider(provider);

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        // video requests run one detection per sampled frame, hence the long tail
        let boundaries = generate_boundaries((10, 50, 100, 500, 5000));

        let detection_duration = meter
            .u64_histogram("detection_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of detection requests in milliseconds")
            .build();

        let flagged_counter = meter
            .u64_counter("flagged_detections_total")
            .with_description("Detections flagged as explicit content")
            .build();

        let frames_sampled = meter
            .u64_counter("frames_sampled_total")
            .with_description("Video frames extracted for classification")
            .build();

        Ok(Metrics {
            request_counter,
            detection_duration,
            flagged_counter,
            frames_sampled,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_detection_duration(&self, duration_ms: u64, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.detection_duration.record(duration_ms, &attributes);
    }

    pub fn record_flagged(&self, count: u64, route: &str) {
        if count == 0 {
            return;
        }
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.flagged_counter.add(count, &attributes);
    }

    pub fn record_frames_sampled(&self, count: u64) {
        self.frames_sampled.add(count, &[]);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 25;
    let end_step: usize = 100;
    let tail_step: usize = 1000;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
