use std::time::Duration;

use log::{trace, warn};
use tokio::time;

use crate::lights::color::Rgb;
use crate::lights::driver::OutputDriver;
use crate::shutdown::Shutdown;

pub const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampOutcome {
	/// Output now shows exactly the target level.
	Completed { steps: u32 },
	/// Shutdown arrived mid-ramp; output was left at `level`.
	Interrupted { level: u8 },
}

/// Fades the output one brightness percent at a time.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
	step_delay: Duration,
}

impl Transition {
	pub fn new(step_delay: Duration) -> Self {
		Transition { step_delay }
	}

	pub fn step_delay(&self) -> Duration {
		self.step_delay
	}

	/// Walk `level` towards `target`, showing `base` scaled by every
	/// intermediate level, then show the exact target once more so no
	/// rounding from the walk is left on the channels.
	pub async fn ramp<D>(
		&self,
		driver: &mut D,
		base: Rgb,
		level: &mut u8,
		target: u8,
		shutdown: &mut Shutdown,
	) -> RampOutcome
	where
		D: OutputDriver + ?Sized,
	{
		let mut steps = 0;
		while *level != target {
			show(driver, base.scale(*level)).await;
			tokio::select! {
				_ = time::sleep(self.step_delay) => {}
				_ = shutdown.wait() => {
					return RampOutcome::Interrupted { level: *level };
				}
			}

			if *level < target {
				*level += 1;
			} else {
				*level -= 1;
			}
			steps += 1;
			trace!("ramp step {steps}: level {}", *level);
		}
		show(driver, base.scale(target)).await;
		RampOutcome::Completed { steps }
	}

	/// Power off skips the fade entirely.
	pub async fn blackout<D>(&self, driver: &mut D)
	where
		D: OutputDriver + ?Sized,
	{
		show(driver, Rgb::OFF).await;
	}
}

impl Default for Transition {
	fn default() -> Self {
		Transition::new(DEFAULT_STEP_DELAY)
	}
}

async fn show<D>(driver: &mut D, color: Rgb)
where
	D: OutputDriver + ?Sized,
{
	if let Err(e) = driver.write(color).await {
		warn!("light output {color} failed: {e}");
	}
}
