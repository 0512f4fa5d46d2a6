use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    frames_sent: Counter<u64>,
    frames_skipped: Counter<u64>,
    send_failures: Counter<u64>,
    send_duration: Histogram<u64>,
    annotations: Counter<u64>,
    malformed_annotations: Counter<u64>,
    annotation_fps: Gauge<f64>,
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

        let meter = provider.meter("guardian_stream");
        global::set_meter_provider(provider);

        let frames_sent = meter
            .u64_counter("frames_sent_total")
            .with_description("Frames handed to the backend channel")
            .build();

        let frames_skipped = meter
            .u64_counter("frames_skipped_total")
            .with_description("Pump ticks skipped because a frame was still in flight")
            .build();

        let send_failures = meter
            .u64_counter("frame_send_failures_total")
            .with_description("Frames that failed to capture, encode or send")
            .build();

        let boundaries = generate_boundaries((5, 25, 45, 245, 1045));

        let send_duration = meter
            .u64_histogram("frame_send_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Time from frame capture until the socket accepted it")
            .build();

        let annotations = meter
            .u64_counter("annotations_total")
            .with_description("Annotation messages received from the backend")
            .build();

        let malformed_annotations = meter
            .u64_counter("malformed_annotations_total")
            .with_description("Inbound payloads dropped by validation")
            .build();

        let annotation_fps = meter
            .f64_gauge("annotation_fps")
            .with_description("Annotation messages received per second")
            .build();

        Ok(Metrics {
            frames_sent,
            frames_skipped,
            send_failures,
            send_duration,
            annotations,
            malformed_annotations,
            annotation_fps,
            registry,
        })
    }

    pub fn record_frame_sent(&self, device_id: &str) {
        self.frames_sent.add(1, &device_attributes(device_id));
    }

    pub fn record_frame_skipped(&self, device_id: &str) {
        self.frames_skipped.add(1, &device_attributes(device_id));
    }

    pub fn record_send_failure(&self, stage: &'static str) {
        self.send_failures.add(1, &[KeyValue::new("stage", stage)]);
    }

    pub fn record_send_duration(&self, duration_ms: u64, device_id: &str) {
        self.send_duration
            .record(duration_ms, &device_attributes(device_id));
    }

    pub fn record_annotation(&self) {
        self.annotations.add(1, &[]);
    }

    pub fn record_malformed_annotation(&self) {
        self.malformed_annotations.add(1, &[]);
    }

    pub fn record_annotation_fps(&self, fps: f64) {
        self.annotation_fps.record(fps, &[]);
    }
}

fn device_attributes(device_id: &str) -> [KeyValue; 1] {
    [KeyValue::new("device", device_id.to_string())]
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 2;
    let end_step: usize = 20;
    let tail_step: usize = 100;
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
