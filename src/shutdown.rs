use tokio::sync::watch;

/// Sending half of the agent-wide shutdown signal.
#[derive(Debug)]
pub struct ShutdownTrigger {
	tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
	pub fn trigger(&self) {
		let _ = self.tx.send(true);
	}
}

/// Receiving half, cloned into every task that has to stop promptly.
#[derive(Clone, Debug)]
pub struct Shutdown {
	rx: watch::Receiver<bool>,
}

impl Shutdown {
	pub fn new() -> (ShutdownTrigger, Shutdown) {
		let (tx, rx) = watch::channel(false);
		(ShutdownTrigger { tx }, Shutdown { rx })
	}

	pub fn is_triggered(&self) -> bool {
		*self.rx.borrow()
	}

	/// Resolves once shutdown was triggered or the trigger was dropped.
	pub async fn wait(&mut self) {
		while !*self.rx.borrow() {
			if self.rx.changed().await.is_err() {
				return;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn wait_returns_after_trigger() {
		let (trigger, mut shutdown) = Shutdown::new();
		assert!(!shutdown.is_triggered());
		trigger.trigger();
		shutdown.wait().await;
		assert!(shutdown.is_triggered());
	}

	#[tokio::test]
	async fn dropping_the_trigger_releases_waiters() {
		let (trigger, mut shutdown) = Shutdown::new();
		drop(trigger);
		shutdown.wait().await;
	}
}
