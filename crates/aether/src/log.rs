use time::macros::format_description;
use tracing::Level;
use tracing_subscriber::{
	fmt::time::LocalTime, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

pub fn init_log(level: Level) -> eyre::Result<()> {
	let filter = tracing_subscriber::filter::Targets::new()
		.with_targets(vec![
			("aether", level),
			("aether_core", level),
			("aether_transport", level),
			("aether_channel", level),
			("aether_stream", level),
			("aether_api", level),
			("aether_client", level),
		])
		.with_default(tracing::level_filters::LevelFilter::INFO);
	let registry = tracing_subscriber::registry();
	registry
		.with(filter)
		.with(
			tracing_subscriber::fmt::layer()
				.with_target(true)
				.with_timer(LocalTime::new(format_description!(
					"[year repr:last_two]-[month]-[day] [hour]:[minute]:[second]"
				))),
		)
		.try_init()?;

	Ok(())
}
