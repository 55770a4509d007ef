use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{Span, field};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Used when `RUST_LOG` is unset. sqlx logs every statement at info.
const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// Correlation id attached to the root span of one invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceId(String);

impl TraceId {
    pub fn new(v: impl Into<String>) -> Self {
        Self(v.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Installs the global subscriber on stderr; stdout is left to command output.
///
/// Fails if a subscriber is already installed.
pub fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_span_events(fmt::format::FmtSpan::CLOSE);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(layer.json().with_current_span(true))
            .try_init()?;
    } else {
        registry.with(layer.compact()).try_init()?;
    }
    Ok(())
}

pub fn root_span(name: &'static str, trace_id: &TraceId) -> Span {
    tracing::info_span!(
        "root",
        command = %name,
        trace_id = %trace_id.as_str(),
        participant_id = field::Empty
    )
}

pub fn annotate_participant(participant_id: &str) {
    Span::current().record("participant_id", field::display(participant_id));
}

/// Awaits `fut`, warning on the `performance` target when it takes longer
/// than `max`.
pub async fn warn_if_slow<F, T>(label: &'static str, max: Duration, fut: F) -> T
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    if elapsed > max {
        tracing::warn!(
            target: "performance",
            label,
            elapsed_ms = elapsed.as_millis() as u64,
            limit_ms = max.as_millis() as u64,
            "slow store round-trip"
        );
    }
    out
}
