//! Colors for the RGB strip.
//!
//! Presets approximate real-world light sources by their Kelvin rating.

use std::fmt;
use std::str::FromStr;

use crate::states::Mode;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rgb {
	pub r: u8,
	pub g: u8,
	pub b: u8,
}

impl Rgb {
	pub const OFF: Rgb = Rgb::new(0, 0, 0);

	pub const fn new(r: u8, g: u8, b: u8) -> Self {
		Rgb { r, g, b }
	}

	/// Scale every channel by `level` percent, truncating like the PWM
	/// duty cycle does. Levels above 100 saturate at full channel value.
	pub fn scale(self, level: u8) -> Rgb {
		let channel = |value: u8| clamp_channel(u32::from(value) * u32::from(level) / 100);
		Rgb::new(channel(self.r), channel(self.g), channel(self.b))
	}

	pub fn channels(self) -> [u8; 3] {
		[self.r, self.g, self.b]
	}
}

impl fmt::Display for Rgb {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
	}
}

fn clamp_channel(value: u32) -> u8 {
	value.min(u32::from(u8::MAX)) as u8
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorPreset {
	Natural,
	Candle,
	Tungsten40W,
	Tungsten100W,
	Halogen,
	CarbonArc,
	HighNoon,
	DirectSunlight,
	OvercastSky,
	ClearBlueSky,
	WarmFluorescent,
	StandardFluorescent,
	CoolWhiteFluorescent,
	FullSpectrumFluorescent,
	GrowLightFluorescent,
	BlackLightFluorescent,
	MercuryVapor,
	SodiumVapor,
	MetalHalide,
	HighPressureSodium,
}

impl ColorPreset {
	pub const fn rgb(self) -> Rgb {
		match self {
			ColorPreset::Natural => Rgb::new(255, 228, 206),
			// 1900K
			ColorPreset::Candle => Rgb::new(255, 147, 41),
			// 2600K
			ColorPreset::Tungsten40W => Rgb::new(255, 197, 143),
			// 2850K
			ColorPreset::Tungsten100W => Rgb::new(255, 214, 170),
			// 3200K
			ColorPreset::Halogen => Rgb::new(255, 241, 224),
			// 5200K
			ColorPreset::CarbonArc => Rgb::new(255, 250, 244),
			// 5400K
			ColorPreset::HighNoon => Rgb::new(255, 255, 251),
			// 6000K
			ColorPreset::DirectSunlight => Rgb::new(255, 255, 255),
			// 7000K
			ColorPreset::OvercastSky => Rgb::new(201, 226, 255),
			// 20000K
			ColorPreset::ClearBlueSky => Rgb::new(64, 156, 255),
			ColorPreset::WarmFluorescent => Rgb::new(255, 244, 229),
			ColorPreset::StandardFluorescent => Rgb::new(244, 255, 250),
			ColorPreset::CoolWhiteFluorescent => Rgb::new(212, 235, 255),
			ColorPreset::FullSpectrumFluorescent => Rgb::new(255, 244, 242),
			ColorPreset::GrowLightFluorescent => Rgb::new(255, 239, 247),
			ColorPreset::BlackLightFluorescent => Rgb::new(167, 0, 255),
			ColorPreset::MercuryVapor => Rgb::new(216, 247, 255),
			ColorPreset::SodiumVapor => Rgb::new(255, 209, 178),
			ColorPreset::MetalHalide => Rgb::new(242, 252, 255),
			ColorPreset::HighPressureSodium => Rgb::new(255, 183, 76),
		}
	}
}

impl FromStr for ColorPreset {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let preset = match s.trim().to_ascii_lowercase().replace(&['-', ' '][..], "_").as_str() {
			"natural" => ColorPreset::Natural,
			"candle" => ColorPreset::Candle,
			"tungsten_40w" => ColorPreset::Tungsten40W,
			"tungsten_100w" => ColorPreset::Tungsten100W,
			"halogen" => ColorPreset::Halogen,
			"carbon_arc" => ColorPreset::CarbonArc,
			"high_noon" => ColorPreset::HighNoon,
			"direct_sunlight" | "white" => ColorPreset::DirectSunlight,
			"overcast_sky" => ColorPreset::OvercastSky,
			"clear_blue_sky" => ColorPreset::ClearBlueSky,
			"warm_fluorescent" => ColorPreset::WarmFluorescent,
			"standard_fluorescent" => ColorPreset::StandardFluorescent,
			"cool_white_fluorescent" => ColorPreset::CoolWhiteFluorescent,
			"full_spectrum_fluorescent" => ColorPreset::FullSpectrumFluorescent,
			"grow_light_fluorescent" => ColorPreset::GrowLightFluorescent,
			"black_light_fluorescent" => ColorPreset::BlackLightFluorescent,
			"mercury_vapor" => ColorPreset::MercuryVapor,
			"sodium_vapor" => ColorPreset::SodiumVapor,
			"metal_halide" => ColorPreset::MetalHalide,
			"high_pressure_sodium" => ColorPreset::HighPressureSodium,
			_ => return Err(format!("unknown color preset {s:?}")),
		};
		Ok(preset)
	}
}

/// Base colors per light mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Palette {
	pub static_color: Rgb,
	pub wave_color: Rgb,
}

impl Palette {
	pub fn new(static_color: Rgb) -> Self {
		Palette {
			static_color,
			wave_color: ColorPreset::OvercastSky.rgb(),
		}
	}

	pub fn base_color(&self, mode: Mode) -> Rgb {
		match mode {
			Mode::Static => self.static_color,
			Mode::Wave => self.wave_color,
		}
	}
}

impl Default for Palette {
	fn default() -> Self {
		Palette::new(ColorPreset::Natural.rgb())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn scaling_truncates_and_hits_exact_endpoints() {
		let base = ColorPreset::Candle.rgb();
		assert_eq!(base.scale(100), base);
		assert_eq!(base.scale(0), Rgb::OFF);
		assert_eq!(base.scale(50), Rgb::new(127, 73, 20));
	}

	#[test]
	fn scaling_saturates_above_full_level() {
		assert_eq!(Rgb::new(200, 10, 255).scale(255), Rgb::new(255, 25, 255));
	}

	#[test]
	fn presets_parse_loosely() {
		assert_eq!("High-Pressure Sodium".parse(), Ok(ColorPreset::HighPressureSodium));
		assert_eq!("white".parse(), Ok(ColorPreset::DirectSunlight));
		assert!("plasma".parse::<ColorPreset>().is_err());
	}

	#[test]
	fn wave_has_its_own_base_color() {
		let palette = Palette::default();
		assert_eq!(palette.base_color(Mode::Static), ColorPreset::Natural.rgb());
		assert_eq!(palette.base_color(Mode::Wave), ColorPreset::OvercastSky.rgb());
	}
}
