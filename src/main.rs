use dotenv::dotenv;
use log::{debug, error, info, warn};
use shadow_light::config::{AgentConfig, DriverKind};
use shadow_light::error::AgentError;
use shadow_light::lights::color::Palette;
use shadow_light::lights::driver::{LogDriver, OutputDriver, PigpioDriver};
use shadow_light::lights::transition::Transition;
use shadow_light::lights::Light;
use shadow_light::reconcile::Reconciler;
use shadow_light::shadow::coap::CoapShadowTransport;
use shadow_light::shadow::{DesiredStateSource, ShadowTransport};
use shadow_light::shutdown::Shutdown;

#[tokio::main]
async fn main() -> Result<(), AgentError> {
	dotenv().ok();
	env_logger::init();
	let config = AgentConfig::from_env()?;
	info!(
		"shadow-light starting for {} at {} ({:?} mode)",
		config.transport.thing_name,
		config.transport.endpoint(),
		config.source.mode
	);
	if !config.transport.credentials.is_empty() {
		warn!("credentials are configured but plain CoAP does not use them");
	}
	debug!("client id {}", config.transport.client_id);

	let (trigger, shutdown) = Shutdown::new();
	tokio::spawn(async move {
		match tokio::signal::ctrl_c().await {
			Ok(()) => {
				info!("interrupt received, shutting down");
				trigger.trigger();
			}
			Err(e) => {
				error!("cannot listen for interrupts: {e}");
				// dropping the trigger would read as a shutdown
				std::future::pending::<()>().await;
			}
		}
	});

	let transport = CoapShadowTransport::new(config.transport.endpoint());
	let palette = Palette::new(config.light.color.rgb());
	let transition = Transition::new(config.light.step_delay);
	match config.light.driver {
		DriverKind::Pigpio => {
			let driver = PigpioDriver::connect(
				&config.light.pigpio_addr,
				config.light.pins,
				config.source.operation_timeout,
			)
			.await?;
			run(config, transport, Light::new(driver, palette, transition), shutdown).await
		}
		DriverKind::Log => {
			run(config, transport, Light::new(LogDriver::default(), palette, transition), shutdown).await
		}
	}
}

async fn run<T, D>(config: AgentConfig, transport: T, light: Light<D>, shutdown: Shutdown) -> Result<(), AgentError>
where
	T: ShadowTransport,
	D: OutputDriver,
{
	let source = DesiredStateSource::new(transport, config.transport.topics(), config.source);
	let light = Reconciler::new(light, source, config.reconcile)
		.run(shutdown)
		.await?;
	info!("stopped with {:?}", light.current_settings());
	Ok(())
}
