use std::collections::HashMap;

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::BindError;

/// Receiver of tokenizer events. Callbacks return a `Result` so schema
/// errors raised while building a tree surface out of [`XmlDriver::parse`].
pub trait ElementHandler {
	fn start_element(
		&mut self,
		name: &str,
		attrs: &HashMap<String, String>,
	) -> Result<(), BindError>;
	fn end_element(&mut self, name: &str) -> Result<(), BindError>;
	fn characters(&mut self, text: &str) -> Result<(), BindError>;

	fn start_cdata(&mut self) -> Result<(), BindError> {
		Ok(())
	}
	fn end_cdata(&mut self) -> Result<(), BindError> {
		Ok(())
	}

	fn comment(&mut self, _text: &str) -> Result<(), BindError> {
		Ok(())
	}
	fn pi(&mut self, _content: &str) -> Result<(), BindError> {
		Ok(())
	}
	fn xml_decl(&mut self) -> Result<(), BindError> {
		Ok(())
	}
	fn doctype(&mut self, _content: &str) -> Result<(), BindError> {
		Ok(())
	}
}

impl<H: ElementHandler> ElementHandler for std::sync::Arc<parking_lot::Mutex<H>> {
	fn start_element(
		&mut self,
		name: &str,
		attrs: &HashMap<String, String>,
	) -> Result<(), BindError> {
		self.lock().start_element(name, attrs)
	}
	fn end_element(&mut self, name: &str) -> Result<(), BindError> {
		self.lock().end_element(name)
	}
	fn characters(&mut self, text: &str) -> Result<(), BindError> {
		self.lock().characters(text)
	}
	fn start_cdata(&mut self) -> Result<(), BindError> {
		self.lock().start_cdata()
	}
	fn end_cdata(&mut self) -> Result<(), BindError> {
		self.lock().end_cdata()
	}
	fn comment(&mut self, text: &str) -> Result<(), BindError> {
		self.lock().comment(text)
	}
	fn pi(&mut self, content: &str) -> Result<(), BindError> {
		self.lock().pi(content)
	}
	fn xml_decl(&mut self) -> Result<(), BindError> {
		self.lock().xml_decl()
	}
	fn doctype(&mut self, content: &str) -> Result<(), BindError> {
		self.lock().doctype(content)
	}
}

const COMPACT_THRESHOLD: usize = 8 * 1024;

/// Incremental adapter over the XML tokenizer. Chunks are appended to a
/// carry buffer; complete events are delivered to the handler and consumed,
/// while a token truncated at the end of a non-final chunk stays buffered
/// until more bytes arrive. Element names are namespace-stripped after the
/// first `:`.
#[derive(Debug, Default)]
pub struct XmlDriver {
	buf: Vec<u8>,
	consumed: usize,
}

enum DeliverFail {
	Handler(BindError),
	Malformed(String),
}

impl XmlDriver {
	pub fn new() -> Self {
		Self::default()
	}

	/// Restore the driver to its pre-first-chunk state.
	pub fn reset(&mut self) {
		self.buf.clear();
		self.consumed = 0;
	}

	pub fn parse(
		&mut self,
		chunk: &[u8],
		is_final: bool,
		handler: &mut dyn ElementHandler,
	) -> Result<(), BindError> {
		if self.consumed > COMPACT_THRESHOLD {
			self.buf.drain(..self.consumed);
			self.consumed = 0;
		}
		self.buf.extend_from_slice(chunk);

		let start = self.consumed;
		let mut reader = Reader::from_reader(&self.buf[start..]);
		reader.config_mut().expand_empty_elements = true;

		let mut scratch: Vec<u8> = Vec::new();
		loop {
			scratch.clear();
			match reader.read_event_into(&mut scratch) {
				Ok(Event::Eof) => break,
				Ok(event) => {
					let pos = start + reader.buffer_position() as usize;
					if !is_final && pos >= self.buf.len() && matches!(event, Event::Text(_)) {
						// Trailing text may continue in the next chunk (or
						// hold a split entity); leave it buffered.
						break;
					}
					match deliver(event, handler) {
						Ok(()) => self.consumed = pos,
						Err(DeliverFail::Handler(e)) => return Err(e),
						Err(DeliverFail::Malformed(message)) => {
							return Err(self.error_at(pos, message));
						},
					}
				},
				Err(quick_xml::Error::Syntax(e)) => {
					if is_final {
						let pos = start + reader.buffer_position() as usize;
						return Err(self.error_at(pos, e.to_string()));
					}
					// Truncated token; await the next chunk.
					break;
				},
				Err(e) => {
					let pos = start + reader.buffer_position() as usize;
					return Err(self.error_at(pos, e.to_string()));
				},
			}
		}
		Ok(())
	}

	fn error_at(&self, offset: usize, message: String) -> BindError {
		let upto = &self.buf[..offset.min(self.buf.len())];
		let line = upto.iter().filter(|b| **b == b'\n').count() as u64 + 1;
		let column = upto
			.iter()
			.rev()
			.take_while(|b| **b != b'\n')
			.count() as u64
			+ 1;
		BindError::Parse { line, column, message }
	}
}

fn deliver(event: Event<'_>, handler: &mut dyn ElementHandler) -> Result<(), DeliverFail> {
	let handler_err = DeliverFail::Handler;
	match event {
		Event::Start(e) => {
			let name = local_name(e.name().as_ref());
			let mut attrs = HashMap::new();
			for attr in e.attributes() {
				let attr = attr.map_err(|err| DeliverFail::Malformed(err.to_string()))?;
				let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
				let value = attr
					.unescape_value()
					.map_err(|err| DeliverFail::Malformed(err.to_string()))?
					.into_owned();
				attrs.insert(key, value);
			}
			handler.start_element(&name, &attrs).map_err(handler_err)
		},
		Event::End(e) => {
			let name = local_name(e.name().as_ref());
			handler.end_element(&name).map_err(handler_err)
		},
		Event::Text(e) => {
			let text = e
				.xml_content()
				.map_err(|err| DeliverFail::Malformed(err.to_string()))?;
			handler.characters(&text).map_err(handler_err)
		},
		Event::CData(e) => {
			handler.start_cdata().map_err(DeliverFail::Handler)?;
			let text = String::from_utf8_lossy(&e);
			handler.characters(&text).map_err(DeliverFail::Handler)?;
			handler.end_cdata().map_err(handler_err)
		},
		Event::GeneralRef(e) => {
			let name = String::from_utf8_lossy(&e);
			match resolve_entity(&name) {
				Some(text) => handler.characters(&text).map_err(handler_err),
				None => handler.characters(&format!("&{name};")).map_err(handler_err),
			}
		},
		Event::Comment(e) => handler
			.comment(&String::from_utf8_lossy(&e))
			.map_err(handler_err),
		Event::PI(e) => handler.pi(&String::from_utf8_lossy(&e)).map_err(handler_err),
		Event::Decl(_) => handler.xml_decl().map_err(handler_err),
		Event::DocType(e) => handler
			.doctype(&String::from_utf8_lossy(&e))
			.map_err(handler_err),
		_ => Ok(()),
	}
}

fn local_name(raw: &[u8]) -> String {
	let name = String::from_utf8_lossy(raw);
	match name.split_once(':') {
		Some((_, local)) => local.to_owned(),
		None => name.into_owned(),
	}
}

fn resolve_entity(name: &str) -> Option<String> {
	let ch = match name {
		"amp" => '&',
		"lt" => '<',
		"gt" => '>',
		"apos" => '\'',
		"quot" => '"',
		_ => {
			let digits = name.strip_prefix('#')?;
			let value = match digits.strip_prefix(['x', 'X']) {
				Some(hex) => u32::from_str_radix(hex, 16).ok()?,
				None => digits.parse().ok()?,
			};
			char::from_u32(value)?
		},
	};
	Some(ch.to_string())
}
