use crate::error::BindError;
use crate::xml::{ElementHandler, XmlDriver};

/// Wraps an [`XmlDriver`] around an event handler (typically a
/// [`crate::TreeBinder`], possibly behind a shared `Arc<Mutex<..>>` handle)
/// and exposes chunked parsing.
pub struct Unmarshaller<H: ElementHandler> {
	driver: XmlDriver,
	handler: H,
}

impl<H: ElementHandler> Unmarshaller<H> {
	pub fn new(handler: H) -> Self {
		Self { driver: XmlDriver::new(), handler }
	}

	/// Feed one chunk of the document. Pass an empty final chunk to mark
	/// end of stream.
	pub fn parse(&mut self, chunk: &[u8], is_final: bool) -> Result<(), BindError> {
		self.driver.parse(chunk, is_final, &mut self.handler)
	}

	pub fn handler(&self) -> &H {
		&self.handler
	}

	pub fn handler_mut(&mut self) -> &mut H {
		&mut self.handler
	}

	pub fn into_handler(self) -> H {
		self.handler
	}

	pub fn reset(&mut self) {
		self.driver.reset();
	}
}
