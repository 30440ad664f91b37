//! Agent configuration, read once from the environment (and `.env`).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::lights::color::ColorPreset;
use crate::lights::driver::RgbPins;
use crate::reconcile::ReconcileConfig;
use crate::shadow::backoff::BackoffPolicy;
use crate::shadow::{ShadowTopics, SourceConfig, SourceMode};

pub const DEFAULT_COAP_PORT: u16 = 5683;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
	pub root_ca: Option<PathBuf>,
	pub certificate: Option<PathBuf>,
	pub private_key: Option<PathBuf>,
}

impl Credentials {
	pub fn is_empty(&self) -> bool {
		self.root_ca.is_none() && self.certificate.is_none() && self.private_key.is_none()
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
	pub host: String,
	pub port: u16,
	pub thing_name: String,
	pub client_id: String,
	pub credentials: Credentials,
}

impl TransportConfig {
	pub fn endpoint(&self) -> String {
		if self.host.contains(':') {
			format!("[{}]:{}", self.host, self.port)
		} else {
			format!("{}:{}", self.host, self.port)
		}
	}

	pub fn topics(&self) -> ShadowTopics {
		ShadowTopics::for_thing(&self.thing_name)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverKind {
	Pigpio,
	Log,
}

impl FromStr for DriverKind {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"pigpio" => Ok(DriverKind::Pigpio),
			"log" => Ok(DriverKind::Log),
			_ => Err(()),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LightConfig {
	pub driver: DriverKind,
	pub pigpio_addr: String,
	pub pins: RgbPins,
	pub color: ColorPreset,
	pub step_delay: Duration,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
	pub transport: TransportConfig,
	pub source: SourceConfig,
	pub reconcile: ReconcileConfig,
	pub light: LightConfig,
}

impl AgentConfig {
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|key| dotenv::var(key).ok())
	}

	pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

		let thing_name = required(&get, "SHADOW_THING_NAME")?;
		let transport = TransportConfig {
			host: required(&get, "SHADOW_HOST")?,
			port: parsed(&get, "SHADOW_PORT", DEFAULT_COAP_PORT)?,
			client_id: get("SHADOW_CLIENT_ID").unwrap_or_else(|| thing_name.clone()),
			thing_name,
			credentials: Credentials {
				root_ca: get("SHADOW_ROOT_CA").map(PathBuf::from),
				certificate: get("SHADOW_CERTIFICATE").map(PathBuf::from),
				private_key: get("SHADOW_PRIVATE_KEY").map(PathBuf::from),
			},
		};

		let mode = match get("SHADOW_MODE").as_deref().map(str::to_ascii_lowercase).as_deref() {
			None | Some("pull") => SourceMode::Pull,
			Some("push") => SourceMode::Push,
			Some(other) => return Err(invalid("SHADOW_MODE", other)),
		};
		let backoff = BackoffPolicy::new(
			millis(&get, "SHADOW_BACKOFF_MIN_MS", 1_000)?,
			millis(&get, "SHADOW_BACKOFF_MAX_MS", 32_000)?,
		);
		if backoff.min.is_zero() || backoff.min > backoff.max {
			return Err(invalid(
				"SHADOW_BACKOFF_MIN_MS",
				&backoff.min.as_millis().to_string(),
			));
		}
		let source = SourceConfig {
			mode,
			operation_timeout: nonzero_millis(&get, "SHADOW_OPERATION_TIMEOUT_MS", 5_000)?,
			connect_timeout: nonzero_millis(&get, "SHADOW_CONNECT_TIMEOUT_MS", 20_000)?,
			backoff,
		};

		let reconcile = ReconcileConfig {
			poll_interval: nonzero_millis(&get, "SHADOW_POLL_INTERVAL_MS", 1_000)?,
			set_desired_on_start: flag(&get, "SHADOW_SET_DESIRED_ON_START", true)?,
		};

		let light = LightConfig {
			driver: parsed(&get, "LIGHT_DRIVER", DriverKind::Pigpio)?,
			pigpio_addr: get("LIGHT_PIGPIO_ADDR").unwrap_or_else(|| "127.0.0.1:8888".to_string()),
			pins: match get("LIGHT_PINS") {
				Some(raw) => parse_pins(&raw).ok_or_else(|| invalid("LIGHT_PINS", &raw))?,
				None => RgbPins::default(),
			},
			color: parsed(&get, "LIGHT_COLOR", ColorPreset::Natural)?,
			step_delay: millis(&get, "LIGHT_STEP_MS", 50)?,
		};

		Ok(AgentConfig {
			transport,
			source,
			reconcile,
			light,
		})
	}
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
	ConfigError::Invalid {
		key,
		value: value.to_string(),
	}
}

fn required(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<String, ConfigError> {
	get(key).ok_or(ConfigError::Missing(key))
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError> {
	match get(key) {
		Some(raw) => raw.trim().parse().map_err(|_| invalid(key, &raw)),
		None => Ok(default),
	}
}

fn millis(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
	parsed(get, key, default).map(Duration::from_millis)
}

fn nonzero_millis(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
	let value = millis(get, key, default)?;
	if value.is_zero() {
		return Err(invalid(key, "0"));
	}
	Ok(value)
}

fn flag(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: bool) -> Result<bool, ConfigError> {
	match get(key) {
		Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
			"1" | "true" | "yes" | "on" => Ok(true),
			"0" | "false" | "no" | "off" => Ok(false),
			_ => Err(invalid(key, &raw)),
		},
		None => Ok(default),
	}
}

fn parse_pins(raw: &str) -> Option<RgbPins> {
	let pins: Vec<u32> = raw
		.split(',')
		.map(|pin| pin.trim().parse().ok())
		.collect::<Option<_>>()?;
	match pins.as_slice() {
		&[r, g, b] => Some(RgbPins { r, g, b }),
		_ => None,
	}
}
