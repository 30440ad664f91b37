use log::{debug, info, warn};

use crate::error::TransportError;
use crate::shadow::source::DesiredStateSource;
use crate::shadow::transport::ShadowTransport;
use crate::states::{decode_reported, encode_reported, encode_startup, ReportedState};

/// Sends reported-state documents. Failures are logged and counted, never
/// returned: the next successful cycle reports again.
#[derive(Debug, Default)]
pub struct ReportedStatePublisher {
	delivered: u64,
	failed: u64,
}

impl ReportedStatePublisher {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn delivered(&self) -> u64 {
		self.delivered
	}

	pub fn failed(&self) -> u64 {
		self.failed
	}

	pub async fn publish<T: ShadowTransport>(
		&mut self,
		source: &mut DesiredStateSource<T>,
		report: &ReportedState,
	) -> bool {
		match encode_reported(report) {
			Ok(payload) => self.send(source, payload).await,
			Err(e) => {
				warn!("shadow: cannot encode reported state {report:?}: {e}");
				self.failed += 1;
				false
			}
		}
	}

	/// First report after boot; with `set_desired` the boot settings also
	/// become the desired state.
	pub async fn publish_startup<T: ShadowTransport>(
		&mut self,
		source: &mut DesiredStateSource<T>,
		report: &ReportedState,
		set_desired: bool,
	) -> bool {
		match encode_startup(report, set_desired) {
			Ok(payload) => self.send(source, payload).await,
			Err(e) => {
				warn!("shadow: cannot encode startup state {report:?}: {e}");
				self.failed += 1;
				false
			}
		}
	}

	async fn send<T: ShadowTransport>(&mut self, source: &mut DesiredStateSource<T>, payload: Vec<u8>) -> bool {
		match source.publish_update(payload).await {
			Ok(ack) => {
				log_acknowledgement(&ack);
				self.delivered += 1;
				true
			}
			Err(TransportError::Timeout) => {
				warn!("shadow: report timed out, will report again next change");
				self.failed += 1;
				false
			}
			Err(e) => {
				warn!("shadow: report not delivered: {e}");
				self.failed += 1;
				false
			}
		}
	}
}

fn log_acknowledgement(ack: &[u8]) {
	if ack.is_empty() {
		return;
	}
	match decode_reported(ack) {
		Ok(Some(fields)) => info!(
			"shadow: reported power_state {:?} brightness {:?} mode {:?}",
			fields.power_state, fields.brightness, fields.mode
		),
		Ok(None) => debug!("shadow: update acknowledged without reported state"),
		Err(e) => debug!("shadow: unreadable update acknowledgement: {e}"),
	}
}

#[cfg(test)]
mod tests {
	use serde_json::{json, Value};

	use super::*;
	use crate::shadow::memory::MemoryShadow;
	use crate::shadow::source::SourceConfig;
	use crate::states::{ActuatorState, Brightness, Mode, PowerState};

	#[tokio::test]
	async fn publishes_reported_document_to_update_topic() {
		let shadow = MemoryShadow::new("lamp");
		let mut source = DesiredStateSource::new(shadow.clone(), shadow.topics().clone(), SourceConfig::default());
		source.connect().await.unwrap();

		let mut publisher = ReportedStatePublisher::new();
		let report = ReportedState {
			power_state: PowerState::On,
			brightness: Brightness::new(12).unwrap(),
			mode: Mode::Wave,
		};
		assert!(publisher.publish(&mut source, &report).await);

		let published = shadow.published();
		assert_eq!(published.len(), 1);
		assert_eq!(published[0].0, shadow.topics().update);
		let body: Value = serde_json::from_slice(&published[0].1).unwrap();
		assert_eq!(
			body,
			json!({"state": {"reported": {"power_state": "ON", "brightness": 12, "mode": "WAVE"}}})
		);
		assert_eq!(publisher.delivered(), 1);
	}

	#[tokio::test]
	async fn startup_report_can_seed_desired_state() {
		let shadow = MemoryShadow::new("lamp");
		let mut source = DesiredStateSource::new(shadow.clone(), shadow.topics().clone(), SourceConfig::default());
		source.connect().await.unwrap();

		let report = ReportedState::from(&ActuatorState::default());
		ReportedStatePublisher::new()
			.publish_startup(&mut source, &report, true)
			.await;

		assert_eq!(shadow.desired(), shadow.reported());
		assert_eq!(
			shadow.desired(),
			Some(json!({"power_state": "OFF", "brightness": 100, "mode": "STATIC"}))
		);
	}

	#[tokio::test]
	async fn failures_are_swallowed() {
		let shadow = MemoryShadow::new("lamp");
		let mut source = DesiredStateSource::new(shadow.clone(), shadow.topics().clone(), SourceConfig::default());

		let mut publisher = ReportedStatePublisher::new();
		let report = ReportedState::from(&ActuatorState::default());
		assert!(!publisher.publish(&mut source, &report).await);
		assert_eq!(publisher.failed(), 1);
	}
}
