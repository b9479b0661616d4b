use color_eyre::Result;
use tracing_error::ErrorLayer;
use tracing_subscriber::{Layer as _, fmt::MakeWriter, layer::SubscriberExt as _};

/// Build the diagnostic logger.
///
/// This is internal tracing for debugging wireit itself, filtered by the
/// `WIREIT_LOG` environment variable; user-visible script output flows
/// through the event bus instead and never through here.
pub fn make_logger<W>(writer: W) -> Result<impl tracing::Subscriber>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let logger = tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(true)
                .with_writer(writer)
                .with_filter(
                    tracing_subscriber::EnvFilter::builder()
                        .with_env_var("WIREIT_LOG")
                        .from_env_lossy(),
                ),
        );
    Ok(logger)
}
