use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative shutdown flag shared between a worker thread and whichever
/// thread tears the owning component down. Once triggered it stays set.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
	flag: Arc<AtomicBool>,
}

impl Shutdown {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn trigger(&self) {
		self.flag.store(true, Ordering::SeqCst);
	}

	pub fn is_triggered(&self) -> bool {
		self.flag.load(Ordering::SeqCst)
	}
}
