//! Structured logging / tracing bootstrap.
//!
//! Grounded on `examples/ProdByBuddha-rust_agency/src/utils/otel.rs`. Unlike
//! the teacher, OTLP export is optional: tests and local runs that never set
//! `OTEL_EXPORTER_OTLP_ENDPOINT` get a bare `fmt` layer so they don't need a
//! collector running.

use opentelemetry::{global, KeyValue};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::{propagation::TraceContextPropagator, runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub struct TelemetryGuard {
    otel_enabled: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.otel_enabled {
            global::shutdown_tracer_provider();
        }
    }
}

pub fn init(service_name: &str) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("council_engine=info"));

    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        if let Ok(guard) = init_with_otlp(service_name, filter) {
            return guard;
        }
        // Fall through to plain logging if the exporter can't be built.
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("council_engine=info"));
    Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
    TelemetryGuard { otel_enabled: false }
}

fn init_with_otlp(
    service_name: &str,
    filter: EnvFilter,
) -> Result<TelemetryGuard, Box<dyn std::error::Error>> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = opentelemetry_otlp::new_exporter().tonic().build_span_exporter()?;

    let trace_config = sdktrace::Config::default().with_resource(Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("environment", "development"),
    ]));

    let provider = sdktrace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(trace_config)
        .build();

    global::set_tracer_provider(provider.clone());
    let tracer = provider.tracer(service_name.to_string());
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    Registry::default()
        .with(filter)
        .with(telemetry)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    Ok(TelemetryGuard { otel_enabled: true })
}
