use std::{num::NonZeroU8, panic};

use anyhow::Result;
use time::format_description::well_known::{iso8601, Iso8601};
use tracing::{error, Level};
use tracing_subscriber::{
    fmt::{time::LocalTime, writer::MakeWriterExt},
    prelude::__tracing_subscriber_SubscriberExt,
    EnvFilter, Layer,
};

const TIMESTAMP: iso8601::EncodedConfig = iso8601::Config::DEFAULT
    .set_time_precision(iso8601::TimePrecision::Second {
        decimal_digits: NonZeroU8::new(3),
    })
    .encode();

fn client_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if cfg!(debug_assertions) { "trace" } else { "info" };
        EnvFilter::new(format!(
            "{}={level},tether_lib={level}",
            env!("CARGO_CRATE_NAME")
        ))
    })
}

/// Warnings and errors go to `dir/file_name` so the chat prompt stays readable. Debug builds
/// mirror everything to the terminal as well.
pub fn init_tracing(dir: &str, file_name: &str, ansi: bool) -> Result<()> {
    let compact = || {
        const WITH_FILE_PATH: bool = cfg!(debug_assertions);
        tracing_subscriber::fmt::layer()
            .compact()
            .with_file(WITH_FILE_PATH)
            .with_line_number(WITH_FILE_PATH)
            .with_target(!WITH_FILE_PATH)
            .with_thread_ids(true)
            .with_timer(LocalTime::new(Iso8601::<TIMESTAMP>))
    };
    let log_file = tracing_appender::rolling::never(dir, file_name).with_max_level(Level::WARN);
    let file_layer = compact()
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(client_filter());
    let terminal_layer = cfg!(debug_assertions)
        .then(|| compact().with_ansi(ansi).with_filter(client_filter()));

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(file_layer.and_then(terminal_layer)),
    )?;
    panic::set_hook(Box::new(|panic| error!("{}", panic)));
    Ok(())
}
