//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use taskhost_observe::tracing_setup::{TracingOptions, init_tracing};
//!
//! // Host process: logs on stdout, spans exported through OpenTelemetry.
//! init_tracing(TracingOptions::host().with_otel(true)).unwrap();
//! ```
//!
//! Worker processes must use [`TracingOptions::worker`]: their stdout is the
//! IPC channel, so logs go to stderr and OpenTelemetry stays off.

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Where formatted log lines are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingOptions {
    pub target: LogTarget,
    pub enable_otel: bool,
    /// Filter used when `RUST_LOG` is unset.
    pub default_directive: String,
    pub service_name: String,
}

impl TracingOptions {
    pub fn host() -> Self {
        Self {
            target: LogTarget::Stdout,
            enable_otel: false,
            default_directive: "info".to_string(),
            service_name: "taskhost".to_string(),
        }
    }

    pub fn worker() -> Self {
        Self {
            target: LogTarget::Stderr,
            enable_otel: false,
            default_directive: "info".to_string(),
            service_name: "taskhost-worker".to_string(),
        }
    }

    /// Enable the stdout span exporter. Ignored for stderr targets.
    pub fn with_otel(mut self, enable: bool) -> Self {
        self.enable_otel = enable;
        self
    }

    pub fn with_default_directive(mut self, directive: impl Into<String>) -> Self {
        self.default_directive = directive.into();
        self
    }

    fn otel_enabled(&self) -> bool {
        self.enable_otel && self.target == LogTarget::Stdout
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))
    }
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self::host()
    }
}

/// Initialize the global tracing subscriber.
///
/// - Always installs a structured `fmt` layer with target visibility and span
///   close timing, writing to the configured [`LogTarget`].
/// - When OpenTelemetry is enabled (host only), additionally bridges spans to
///   OpenTelemetry using a stdout exporter.
/// - Respects `RUST_LOG`, falling back to the default directive.
///
/// # Errors
///
/// Returns an error if the global subscriber has already been set.
pub fn init_tracing(options: TracingOptions) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let writer = match options.target {
        LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
    };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(options.target == LogTarget::Stdout)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(writer);

    let env_filter = options.env_filter();

    if options.otel_enabled() {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer(options.service_name.clone());
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// No-op when OpenTelemetry was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
