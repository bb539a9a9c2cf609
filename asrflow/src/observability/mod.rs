//! Tracing setup and span helpers.

use crate::stages::StageInvocation;
use tracing::{Span, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

/// Builds the subscriber `init_tracing` installs, writing to `writer`.
fn subscriber<W>(default_filter: &str, json: bool, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let output: Box<dyn Layer<Registry> + Send + Sync> = if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer().with_target(false).with_writer(writer).boxed()
    };

    tracing_subscriber::registry().with(output).with(filter)
}

/// Installs the global subscriber.
///
/// `RUST_LOG` takes priority over `default_filter`. With `json` set, events
/// are written as one JSON object per line.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(default_filter: &str, json: bool) -> Result<(), TryInitError> {
    subscriber(default_filter, json, std::io::stdout).try_init()
}

/// Span covering one stage run.
#[must_use]
pub fn stage_span(invocation: &StageInvocation) -> Span {
    tracing::info_span!(
        "stage",
        calc_dir = %invocation.calc_dir,
        kind = %invocation.kind,
        prev = invocation.prev_calculation.as_deref().unwrap_or("-"),
    )
}
