//! The reconciliation loop.
//!
//! One worker owns the light. Each tick it obtains a desired state, compares
//! it with the light, fades to it when different and reports the result.
//! Ramps run inline, so a tick never overlaps another tick's ramp.

use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::time::{self, MissedTickBehavior};

use crate::error::{AgentError, TransportError};
use crate::lights::driver::OutputDriver;
use crate::lights::transition::RampOutcome;
use crate::lights::Light;
use crate::shadow::{DesiredStateSource, ReportedStatePublisher, ShadowTransport, SourceError, SourceMode};
use crate::shutdown::Shutdown;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
	Idle,
	Fetching,
	Unchanged,
	Applying,
	Reporting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
	/// The store had nothing for us this tick.
	NoDocument,
	/// The document was unreadable; the light kept its state.
	DecodeFailed,
	/// The store is unreachable; waiting on reconnect.
	Stalled,
	Unchanged,
	Applied { reported: bool },
	/// Shutdown arrived mid-tick.
	Interrupted,
}

#[derive(Clone, Debug)]
pub struct ReconcileConfig {
	pub poll_interval: Duration,
	/// Publish the boot settings as the desired state on startup.
	pub set_desired_on_start: bool,
}

impl Default for ReconcileConfig {
	fn default() -> Self {
		ReconcileConfig {
			poll_interval: Duration::from_secs(1),
			set_desired_on_start: true,
		}
	}
}

pub struct Reconciler<T, D> {
	light: Light<D>,
	source: DesiredStateSource<T>,
	publisher: ReportedStatePublisher,
	config: ReconcileConfig,
	phase: Phase,
}

impl<T: ShadowTransport, D: OutputDriver> Reconciler<T, D> {
	pub fn new(light: Light<D>, source: DesiredStateSource<T>, config: ReconcileConfig) -> Self {
		Reconciler {
			light,
			source,
			publisher: ReportedStatePublisher::new(),
			config,
			phase: Phase::Idle,
		}
	}

	pub fn light(&self) -> &Light<D> {
		&self.light
	}

	pub fn source(&self) -> &DesiredStateSource<T> {
		&self.source
	}

	pub fn publisher(&self) -> &ReportedStatePublisher {
		&self.publisher
	}

	pub fn phase(&self) -> Phase {
		self.phase
	}

	fn enter(&mut self, phase: Phase) {
		trace!("reconcile: {:?} -> {:?}", self.phase, phase);
		self.phase = phase;
	}

	/// Connect, show the boot state and announce it. Only a failed first
	/// connection is fatal.
	pub async fn start(&mut self, shutdown: &mut Shutdown) -> Result<(), AgentError> {
		self.source
			.connect()
			.await
			.map_err(AgentError::InitialConnect)?;
		self.light.show(shutdown).await;

		let report = self.light.current_settings();
		self.publisher
			.publish_startup(&mut self.source, &report, self.config.set_desired_on_start)
			.await;
		Ok(())
	}

	pub async fn tick(&mut self, shutdown: &mut Shutdown) -> TickOutcome {
		self.enter(Phase::Fetching);
		let outcome = self.reconcile_once(shutdown).await;
		self.enter(Phase::Idle);
		outcome
	}

	async fn reconcile_once(&mut self, shutdown: &mut Shutdown) -> TickOutcome {
		let desired = match self.source.next_desired(shutdown).await {
			Ok(Some(desired)) => desired,
			Ok(None) => return TickOutcome::NoDocument,
			Err(SourceError::Decode(e)) => {
				warn!("reconcile: skipping tick, {e}");
				return TickOutcome::DecodeFailed;
			}
			Err(SourceError::Transport(TransportError::Timeout)) => {
				debug!("reconcile: shadow fetch timed out");
				return TickOutcome::NoDocument;
			}
			Err(SourceError::Transport(e)) => {
				debug!("reconcile: shadow unavailable: {e}");
				return TickOutcome::Stalled;
			}
			Err(SourceError::Shutdown) => return TickOutcome::Interrupted,
		};

		if !self.light.needs_update(&desired) {
			self.enter(Phase::Unchanged);
			return TickOutcome::Unchanged;
		}

		self.enter(Phase::Applying);
		if let RampOutcome::Interrupted { level } = self.light.apply(&desired, shutdown).await {
			info!("reconcile: transition stopped at {level}% for shutdown");
			return TickOutcome::Interrupted;
		}

		self.enter(Phase::Reporting);
		let report = self.light.current_settings();
		let reported = self.publisher.publish(&mut self.source, &report).await;
		TickOutcome::Applied { reported }
	}

	/// Run until shutdown, then disconnect and hand the light back.
	pub async fn run(mut self, mut shutdown: Shutdown) -> Result<Light<D>, AgentError> {
		self.start(&mut shutdown).await?;

		let mut ticker = time::interval(self.config.poll_interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			if self.source.mode() == SourceMode::Pull {
				tokio::select! {
					_ = ticker.tick() => {}
					_ = shutdown.wait() => break,
				}
			}
			if shutdown.is_triggered() {
				break;
			}
			let outcome = self.tick(&mut shutdown).await;
			if outcome == TickOutcome::Interrupted {
				break;
			}
			// push mode has no ticker to pace failing ticks
			if self.source.mode() == SourceMode::Push
				&& matches!(outcome, TickOutcome::DecodeFailed | TickOutcome::Stalled)
			{
				tokio::select! {
					_ = time::sleep(self.config.poll_interval) => {}
					_ = shutdown.wait() => break,
				}
			}
		}

		info!("reconcile: shutting down");
		if let Err(e) = self.source.disconnect().await {
			warn!("reconcile: disconnect failed: {e}");
		}
		Ok(self.light)
	}
}
