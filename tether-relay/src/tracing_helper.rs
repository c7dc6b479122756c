use std::{num::NonZeroU8, panic};

use anyhow::Result;
use time::format_description::well_known::{
    iso8601::{self, EncodedConfig},
    Iso8601,
};
use tracing::error;
use tracing_subscriber::{
    fmt::{self, time::LocalTime},
    prelude::__tracing_subscriber_SubscriberExt,
    EnvFilter, Layer, Registry,
};

const TIMESTAMP: EncodedConfig = iso8601::Config::DEFAULT
    .set_time_precision(iso8601::TimePrecision::Second {
        decimal_digits: NonZeroU8::new(6),
    })
    .encode();

/// `RUST_LOG` wins; otherwise the relay and the envelope codec log at debug (info in release).
fn relay_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if cfg!(debug_assertions) { "debug" } else { "info" };
        EnvFilter::new(format!(
            "{}={level},tether_lib={level}",
            env!("CARGO_CRATE_NAME")
        ))
    })
}

/// `plain` drops timestamps and colors, for hosts whose log collector stamps lines itself.
pub fn init_tracing(plain: bool) -> Result<()> {
    const WITH_FILE_PATH: bool = cfg!(debug_assertions);
    let layer = fmt::layer::<Registry>()
        .compact()
        .with_file(WITH_FILE_PATH)
        .with_line_number(WITH_FILE_PATH)
        .with_target(!WITH_FILE_PATH)
        .with_thread_ids(true);
    let layer = if plain {
        layer.without_time().with_ansi(false).boxed()
    } else {
        layer
            .with_timer(LocalTime::new(Iso8601::<TIMESTAMP>))
            .boxed()
    };
    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(layer.with_filter(relay_filter())),
    )?;
    panic::set_hook(Box::new(|panic| error!("{}", panic)));
    Ok(())
}
