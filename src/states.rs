use std::fmt;

use log::warn;

use crate::error::{excerpt, DecodeError, StateError};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
	#[serde(rename = "ON")]
	On,
	#[serde(rename = "OFF")]
	Off,
}

impl fmt::Display for PowerState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PowerState::On => f.write_str("ON"),
			PowerState::Off => f.write_str("OFF"),
		}
	}
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
	#[serde(rename = "STATIC", alias = "STILL")]
	Static,
	#[serde(rename = "WAVE")]
	Wave,
}

impl fmt::Display for Mode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Mode::Static => f.write_str("STATIC"),
			Mode::Wave => f.write_str("WAVE"),
		}
	}
}

/// Brightness percentage, always within `0..=100`.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Brightness(u8);

impl Brightness {
	pub const MIN: Brightness = Brightness(0);
	pub const MAX: Brightness = Brightness(100);

	pub fn new(value: i64) -> Result<Self, StateError> {
		if (0..=100).contains(&value) {
			Ok(Brightness(value as u8))
		} else {
			Err(StateError::OutOfRangeValue {
				field: "brightness",
				value,
				min: 0,
				max: 100,
			})
		}
	}

	pub fn percent(self) -> u8 {
		self.0
	}
}

impl TryFrom<i64> for Brightness {
	type Error = StateError;

	fn try_from(value: i64) -> Result<Self, Self::Error> {
		Brightness::new(value)
	}
}

/// Target configuration handed to the light. `None` means "no opinion".
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DesiredState {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub power_state: Option<PowerState>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub brightness: Option<Brightness>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub mode: Option<Mode>,
}

impl DesiredState {
	pub fn is_empty(&self) -> bool {
		self.power_state.is_none() && self.brightness.is_none() && self.mode.is_none()
	}
}

/// State owned by the light. `brightness` is the last applied target,
/// `transition_brightness` is what the hardware is showing right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActuatorState {
	pub power_state: PowerState,
	pub brightness: Brightness,
	pub mode: Mode,
	pub transition_brightness: u8,
}

impl Default for ActuatorState {
	/// Boot defaults: off, full brightness, static.
	fn default() -> Self {
		ActuatorState {
			power_state: PowerState::Off,
			brightness: Brightness::MAX,
			mode: Mode::Static,
			transition_brightness: Brightness::MAX.percent(),
		}
	}
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReportedState {
	pub power_state: PowerState,
	pub brightness: Brightness,
	pub mode: Mode,
}

impl From<&ActuatorState> for ReportedState {
	fn from(state: &ActuatorState) -> Self {
		ReportedState {
			power_state: state.power_state,
			brightness: state.brightness,
			mode: state.mode,
		}
	}
}

impl From<ReportedState> for DesiredState {
	fn from(report: ReportedState) -> Self {
		DesiredState {
			power_state: Some(report.power_state),
			brightness: Some(report.brightness),
			mode: Some(report.mode),
		}
	}
}

/// Loosely typed light fields as they appear on the wire.
#[derive(Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ShadowFields {
	pub power_state: Option<PowerState>,
	pub brightness: Option<i64>,
	pub mode: Option<Mode>,
}

#[derive(Deserialize, Debug, Default)]
struct WireState {
	desired: Option<ShadowFields>,
	reported: Option<ShadowFields>,
}

/// Either `{"state": ...}` or the documents form `{"current": {"state": ...}}`.
#[derive(Deserialize, Debug, Default)]
struct WireDocument {
	state: Option<WireState>,
	current: Option<Box<WireDocument>>,
}

impl WireDocument {
	fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
		serde_json::from_slice(payload).map_err(|e| DecodeError::new(e.to_string(), payload))
	}

	fn into_state(self) -> Option<WireState> {
		match self.state {
			Some(state) => Some(state),
			None => self.current.and_then(|current| current.into_state()),
		}
	}
}

/// Decode the `desired` section of a shadow document.
///
/// `Ok(None)` means the document carried no desired section. Out-of-range
/// values are logged and dropped so the rest of the document still applies.
pub fn decode_desired(payload: &[u8]) -> Result<Option<DesiredState>, DecodeError> {
	let fields = match WireDocument::parse(payload)?
		.into_state()
		.and_then(|state| state.desired)
	{
		Some(fields) => fields,
		None => return Ok(None),
	};

	let brightness = match fields.brightness.map(Brightness::new).transpose() {
		Ok(brightness) => brightness,
		Err(err) => {
			warn!("{err}; keeping current brightness (payload: {:?})", excerpt(payload));
			None
		}
	};

	Ok(Some(DesiredState {
		power_state: fields.power_state,
		brightness,
		mode: fields.mode,
	}))
}

/// Decode the `reported` section echoed back by an update acknowledgement.
pub fn decode_reported(payload: &[u8]) -> Result<Option<ShadowFields>, DecodeError> {
	Ok(WireDocument::parse(payload)?
		.into_state()
		.and_then(|state| state.reported))
}

#[derive(Serialize)]
struct OutboundState<'a> {
	#[serde(skip_serializing_if = "Option::is_none")]
	desired: Option<&'a DesiredState>,
	#[serde(skip_serializing_if = "Option::is_none")]
	reported: Option<&'a ReportedState>,
}

#[derive(Serialize)]
struct OutboundDocument<'a> {
	state: OutboundState<'a>,
}

pub fn encode_reported(report: &ReportedState) -> serde_json::Result<Vec<u8>> {
	serde_json::to_vec(&OutboundDocument {
		state: OutboundState {
			desired: None,
			reported: Some(report),
		},
	})
}

pub fn encode_desired(desired: &DesiredState) -> serde_json::Result<Vec<u8>> {
	serde_json::to_vec(&OutboundDocument {
		state: OutboundState {
			desired: Some(desired),
			reported: None,
		},
	})
}

/// Startup document: the report, optionally doubling as the desired state.
pub fn encode_startup(report: &ReportedState, set_desired: bool) -> serde_json::Result<Vec<u8>> {
	let desired = DesiredState::from(*report);
	serde_json::to_vec(&OutboundDocument {
		state: OutboundState {
			desired: set_desired.then_some(&desired),
			reported: Some(report),
		},
	})
}
