use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

use crate::error::OutputError;
use crate::lights::color::Rgb;

/// Physical output of the light: one color at a time.
#[async_trait]
pub trait OutputDriver: Send {
	async fn write(&mut self, color: Rgb) -> Result<(), OutputError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RgbPins {
	pub r: u32,
	pub g: u32,
	pub b: u32,
}

impl Default for RgbPins {
	fn default() -> Self {
		RgbPins { r: 4, g: 17, b: 22 }
	}
}

/// pigpio daemon command: set PWM duty cycle.
const PI_CMD_PWM: u32 = 5;

/// Drives the GPIO PWM pins through the pigpio daemon socket.
///
/// Every command is a 16 byte frame of four little-endian `u32`s
/// (`cmd, p1, p2, p3`); the reply echoes the frame with the result in the
/// last slot, negative on failure.
pub struct PigpioDriver {
	stream: TcpStream,
	pins: RgbPins,
	timeout: Duration,
}

impl PigpioDriver {
	pub async fn connect(addr: &str, pins: RgbPins, timeout: Duration) -> Result<Self, OutputError> {
		let stream = time::timeout(timeout, TcpStream::connect(addr))
			.await
			.map_err(|_| OutputError::Timeout)??;
		stream.set_nodelay(true)?;
		info!("pigpio: connected to {addr}, pins r={} g={} b={}", pins.r, pins.g, pins.b);
		Ok(PigpioDriver {
			stream,
			pins,
			timeout,
		})
	}

	async fn command(&mut self, command: u32, p1: u32, p2: u32) -> Result<u32, OutputError> {
		let mut frame = [0u8; 16];
		frame[0..4].copy_from_slice(&command.to_le_bytes());
		frame[4..8].copy_from_slice(&p1.to_le_bytes());
		frame[8..12].copy_from_slice(&p2.to_le_bytes());

		let stream = &mut self.stream;
		let exchange = async move {
			stream.write_all(&frame).await?;
			let mut reply = [0u8; 16];
			stream.read_exact(&mut reply).await?;
			Ok::<_, std::io::Error>(reply)
		};
		let reply = time::timeout(self.timeout, exchange)
			.await
			.map_err(|_| OutputError::Timeout)??;

		let result = i32::from_le_bytes([reply[12], reply[13], reply[14], reply[15]]);
		if result < 0 {
			return Err(OutputError::Rejected {
				command,
				code: result,
			});
		}
		Ok(result as u32)
	}
}

#[async_trait]
impl OutputDriver for PigpioDriver {
	async fn write(&mut self, color: Rgb) -> Result<(), OutputError> {
		let pins = self.pins;
		for (pin, value) in [pins.r, pins.g, pins.b].into_iter().zip(color.channels()) {
			self.command(PI_CMD_PWM, pin, u32::from(value)).await?;
		}
		Ok(())
	}
}

/// Output for machines without the LED hardware: logs color changes.
#[derive(Debug, Default)]
pub struct LogDriver {
	last: Option<Rgb>,
}

#[async_trait]
impl OutputDriver for LogDriver {
	async fn write(&mut self, color: Rgb) -> Result<(), OutputError> {
		if self.last != Some(color) {
			debug!("light output {color}");
			self.last = Some(color);
		}
		Ok(())
	}
}

/// Test double that keeps every color it was asked to show.
#[derive(Clone, Debug, Default)]
pub struct RecordingDriver {
	writes: Arc<Mutex<Vec<Rgb>>>,
}

impl RecordingDriver {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn history(&self) -> Vec<Rgb> {
		self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
	}

	pub fn last(&self) -> Option<Rgb> {
		self.history().last().copied()
	}

	pub fn clear(&self) {
		self.writes.lock().unwrap_or_else(|e| e.into_inner()).clear();
	}
}

#[async_trait]
impl OutputDriver for RecordingDriver {
	async fn write(&mut self, color: Rgb) -> Result<(), OutputError> {
		self.writes
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.push(color);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use tokio::net::TcpListener;

	use super::*;

	#[tokio::test]
	async fn pigpio_driver_sends_one_pwm_frame_per_channel() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap().to_string();

		let daemon = tokio::spawn(async move {
			let (mut socket, _) = listener.accept().await.unwrap();
			let mut frames = Vec::new();
			for _ in 0..3 {
				let mut frame = [0u8; 16];
				socket.read_exact(&mut frame).await.unwrap();
				frames.push(frame);
				let mut reply = frame;
				reply[12..16].copy_from_slice(&0i32.to_le_bytes());
				socket.write_all(&reply).await.unwrap();
			}
			frames
		});

		let mut driver = PigpioDriver::connect(&addr, RgbPins::default(), Duration::from_secs(1))
			.await
			.unwrap();
		driver.write(Rgb::new(10, 20, 30)).await.unwrap();

		let frames = daemon.await.unwrap();
		let decoded: Vec<(u32, u32, u32)> = frames
			.iter()
			.map(|f| {
				let word = |i: usize| u32::from_le_bytes([f[i], f[i + 1], f[i + 2], f[i + 3]]);
				(word(0), word(4), word(8))
			})
			.collect();
		assert_eq!(decoded, vec![(5, 4, 10), (5, 17, 20), (5, 22, 30)]);
	}

	#[tokio::test]
	async fn pigpio_errors_surface_as_rejections() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap().to_string();

		tokio::spawn(async move {
			let (mut socket, _) = listener.accept().await.unwrap();
			let mut frame = [0u8; 16];
			socket.read_exact(&mut frame).await.unwrap();
			frame[12..16].copy_from_slice(&(-8i32).to_le_bytes());
			socket.write_all(&frame).await.unwrap();
		});

		let mut driver = PigpioDriver::connect(&addr, RgbPins::default(), Duration::from_secs(1))
			.await
			.unwrap();
		let err = driver.write(Rgb::OFF).await.unwrap_err();
		assert!(matches!(err, OutputError::Rejected { command: 5, code: -8 }));
	}
}
