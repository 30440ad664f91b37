pub mod color;
pub mod driver;
pub mod transition;

use log::info;

use crate::lights::color::Palette;
use crate::lights::driver::OutputDriver;
use crate::lights::transition::{RampOutcome, Transition};
use crate::shutdown::Shutdown;
use crate::states::{ActuatorState, DesiredState, PowerState, ReportedState};

/// The light as the agent sees it: stored settings plus the hardware output.
pub struct Light<D> {
	state: ActuatorState,
	palette: Palette,
	transition: Transition,
	driver: D,
}

impl<D: OutputDriver> Light<D> {
	pub fn new(driver: D, palette: Palette, transition: Transition) -> Self {
		Self::with_state(driver, palette, transition, ActuatorState::default())
	}

	pub fn with_state(
		driver: D,
		palette: Palette,
		transition: Transition,
		state: ActuatorState,
	) -> Self {
		Light {
			state,
			palette,
			transition,
			driver,
		}
	}

	pub fn state(&self) -> &ActuatorState {
		&self.state
	}

	pub fn driver(&self) -> &D {
		&self.driver
	}

	pub fn current_settings(&self) -> ReportedState {
		ReportedState::from(&self.state)
	}

	/// True when any field the desired state has an opinion on differs.
	pub fn needs_update(&self, desired: &DesiredState) -> bool {
		fn differs<T: PartialEq>(wanted: Option<T>, current: T) -> bool {
			wanted.map_or(false, |wanted| wanted != current)
		}

		differs(desired.power_state, self.state.power_state)
			|| differs(desired.brightness, self.state.brightness)
			|| differs(desired.mode, self.state.mode)
	}

	/// Store the desired settings and drive the output to match.
	///
	/// Brightness is kept while switched off, so the next power on resumes
	/// from it. The fade always starts at the previously applied brightness.
	pub async fn apply(&mut self, desired: &DesiredState, shutdown: &mut Shutdown) -> RampOutcome {
		let previous = self.state.brightness;
		if let Some(power_state) = desired.power_state {
			self.state.power_state = power_state;
		}
		if let Some(brightness) = desired.brightness {
			self.state.brightness = brightness;
		}
		if let Some(mode) = desired.mode {
			self.state.mode = mode;
		}
		info!(
			"light: power {} brightness {} -> {} mode {}",
			self.state.power_state,
			previous.percent(),
			self.state.brightness.percent(),
			self.state.mode
		);

		self.render_from(previous.percent(), shutdown).await
	}

	/// Push the stored settings to the hardware without fading.
	pub async fn show(&mut self, shutdown: &mut Shutdown) -> RampOutcome {
		self.render_from(self.state.brightness.percent(), shutdown).await
	}

	async fn render_from(&mut self, start: u8, shutdown: &mut Shutdown) -> RampOutcome {
		let target = self.state.brightness.percent();
		if self.state.power_state == PowerState::Off {
			self.state.transition_brightness = target;
			self.transition.blackout(&mut self.driver).await;
			return RampOutcome::Completed { steps: 0 };
		}

		let base = self.palette.base_color(self.state.mode);
		self.state.transition_brightness = start;
		self.transition
			.ramp(
				&mut self.driver,
				base,
				&mut self.state.transition_brightness,
				target,
				shutdown,
			)
			.await
	}
}
