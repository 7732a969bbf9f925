use std::time::{Duration, Instant};

use tracing::{Span, field};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

/// Correlates every log line of one job run or CLI command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceId(String);

impl TraceId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// JSON in production, pretty everywhere else.
    pub fn for_app_env(app_env: Option<&str>) -> Self {
        match app_env.map(str::trim) {
            Some(env) if env.eq_ignore_ascii_case("production") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

pub fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let base = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_span_events(fmt::format::FmtSpan::CLOSE);

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(base.json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(base.pretty())
            .init(),
    }
}

/// One per scheduled job run or CLI command.
pub fn root_span(job: &'static str, trace_id: &TraceId) -> Span {
    tracing::info_span!(
        "job",
        job = %job,
        trace_id = %trace_id.as_str(),
        staff_id = field::Empty,
        owner_id = field::Empty,
        booking_id = field::Empty
    )
}

/// Records the booking being worked on in the current span. Spans without
/// those fields ignore them.
pub fn annotate_span(owner_id: &str, booking_id: &Uuid) {
    let span = Span::current();
    span.record("owner_id", field::display(owner_id));
    span.record("booking_id", field::display(booking_id));
}

/// Awaits `fut` and logs under the `performance` target when it took longer
/// than `budget`.
pub async fn warn_if_slow<F, T>(label: &'static str, budget: Duration, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    if elapsed > budget {
        tracing::warn!(
            target: "performance",
            label,
            elapsed_ms = elapsed.as_millis() as u64,
            budget_ms = budget.as_millis() as u64,
            "slow operation"
        );
    }
    out
}
