use std::cmp::Reverse;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, JoinHandle};

use bus_core::prelude::*;
use bus_core::signal::Shutdown;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use keyed_priority_queue::KeyedPriorityQueue;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::message::{ControlAction, MessageRef, MessageType, now_ms};
use crate::service::ListenerRef;

/// A polling subscription stops re-enqueueing after this many deliveries.
pub const MAX_POLL_COUNT: u32 = 65536;

/// Per message-type veto evaluated before a message is enqueued.
pub type ActivityCallback = Arc<dyn Fn(&MessageRef) -> bool + Send + Sync>;

pub(crate) struct QueuedMessage {
	pub listeners: Vec<ListenerRef>,
	pub message: MessageRef,
	pub suspended: bool,
}

enum Post {
	Message(Box<QueuedMessage>),
	Stop,
}

/// Time ordered delivery queue with a single worker thread. Producers post
/// over a channel that doubles as the wait list: the worker drains it
/// between dispatch rounds and sleeps until the next scheduled delivery,
/// so posters never block on an in-flight dispatch.
pub struct DeliveryQueue {
	tx: Sender<Post>,
	worker: Mutex<Option<JoinHandle<()>>>,
	shutdown: Shutdown,
	activity: RwLock<HashMap<MessageType, Vec<ActivityCallback>>>,
}

impl DeliveryQueue {
	pub fn new() -> Self {
		let (tx, rx) = unbounded();
		let shutdown = Shutdown::new();
		let worker = {
			let shutdown = shutdown.clone();
			thread::Builder::new()
				.name("messagebus-delivery".into())
				.spawn(move || Worker::new(rx, shutdown).run())
				.expect("failed to spawn delivery queue worker thread")
		};
		Self {
			tx,
			worker: Mutex::new(Some(worker)),
			shutdown,
			activity: RwLock::new(HashMap::new()),
		}
	}

	pub fn add_activity_callback(&self, msg_type: MessageType, callback: ActivityCallback) {
		self.activity.write().entry(msg_type).or_default().push(callback);
	}

	pub(crate) fn post(&self, listeners: Vec<ListenerRef>, message: MessageRef) {
		{
			let msg_type = message.lock().msg_type;
			let activity = self.activity.read();
			if let Some(callbacks) = activity.get(&msg_type) {
				for callback in callbacks {
					if !callback(&message) {
						trace!(subject = %message.lock().subject, "post vetoed by activity callback");
						return;
					}
				}
			}
		}
		let queued = QueuedMessage { listeners, message, suspended: false };
		if self.tx.send(Post::Message(Box::new(queued))).is_err() {
			warn!("delivery queue is stopped; message dropped");
		}
	}

	/// Stop the worker. The in-flight dispatch completes; pending timers
	/// are discarded.
	pub fn stop(&self) {
		self.shutdown.trigger();
		let _ = self.tx.send(Post::Stop);
		if let Some(handle) = self.worker.lock().take() {
			if handle.join().is_err() {
				error!("delivery worker terminated abnormally");
			}
		}
	}
}

impl Default for DeliveryQueue {
	fn default() -> Self {
		Self::new()
	}
}

impl Drop for DeliveryQueue {
	fn drop(&mut self) {
		self.stop();
	}
}

struct Worker {
	rx: Receiver<Post>,
	shutdown: Shutdown,
	// Removable min-heap: priorities order by (post_time, enqueue seq) so
	// equal post times preserve posting order.
	order: KeyedPriorityQueue<Uuid, Reverse<(i64, u64)>>,
	entries: HashMap<Uuid, QueuedMessage>,
	seq: u64,
}

impl Worker {
	fn new(rx: Receiver<Post>, shutdown: Shutdown) -> Self {
		Self {
			rx,
			shutdown,
			order: KeyedPriorityQueue::new(),
			entries: HashMap::new(),
			seq: 0,
		}
	}

	fn run(mut self) {
		loop {
			if self.shutdown.is_triggered() {
				return;
			}
			// Drain the wait list into the heap between dispatch rounds.
			loop {
				match self.rx.try_recv() {
					Ok(Post::Message(queued)) => self.enqueue(*queued),
					Ok(Post::Stop) | Err(TryRecvError::Disconnected) => return,
					Err(TryRecvError::Empty) => break,
				}
			}

			let next_due = self.order.peek().map(|(_, priority)| priority.0.0);
			match next_due {
				None => match self.rx.recv() {
					Ok(Post::Message(queued)) => {
						self.enqueue(*queued);
						continue;
					},
					Ok(Post::Stop) | Err(_) => return,
				},
				Some(post_time) => {
					let remaining = post_time - now_ms();
					if remaining > 0 {
						match self.rx.recv_timeout(Duration::from_millis(remaining as u64)) {
							Ok(Post::Message(queued)) => self.enqueue(*queued),
							Ok(Post::Stop) => return,
							Err(RecvTimeoutError::Timeout) => {},
							Err(RecvTimeoutError::Disconnected) => return,
						}
						continue;
					}
				},
			}

			// Head of the heap is due.
			let Some((id, _)) = self.order.pop() else {
				continue;
			};
			let Some(queued) = self.entries.remove(&id) else {
				continue;
			};
			self.dispatch(queued);
		}
	}

	fn enqueue(&mut self, queued: QueuedMessage) {
		let (id, post_time) = {
			let message = queued.message.lock();
			(message.id(), message.post_time_ms())
		};
		self.seq += 1;
		self.order.push(id, Reverse((post_time, self.seq)));
		self.entries.insert(id, queued);
	}

	fn dispatch(&mut self, mut queued: QueuedMessage) {
		if queued.suspended {
			queued.message.lock().schedule_post();
			self.enqueue(queued);
			return;
		}

		let (msg_type, control) = {
			let message = queued.message.lock();
			(message.msg_type, message.control)
		};

		if msg_type == MessageType::P2PSub {
			if control == ControlAction::None {
				self.fire(&queued);
				let requeue = {
					let mut message = queued.message.lock();
					if message.delay_ms() > 0 && message.post_count() < MAX_POLL_COUNT {
						message.inc_post_count();
						message.schedule_post();
						true
					} else {
						false
					}
				};
				if requeue {
					trace!(subject = %queued.message.lock().subject, "subscription requeued");
					self.enqueue(queued);
				}
			} else {
				self.apply_control(&queued);
			}
		} else {
			self.fire(&queued);
		}
	}

	fn fire(&self, queued: &QueuedMessage) {
		for listener in &queued.listeners {
			let outcome =
				catch_unwind(AssertUnwindSafe(|| listener.on_message(&queued.message)));
			if outcome.is_err() {
				error!(
					subject = %queued.message.lock().subject,
					"listener panicked during dispatch"
				);
			}
		}
	}

	/// Apply a subscription control action against the queued snapshot:
	/// notify each matching subscription's listeners with the control
	/// message attached, then cancel, suspend or resume it.
	fn apply_control(&mut self, control: &QueuedMessage) {
		let (subject, resp_subject, target, action) = {
			let message = control.message.lock();
			(
				message.subject.clone(),
				message.resp_subject.clone(),
				message.target_msg_id,
				message.control,
			)
		};
		debug!(%subject, ?action, "applying subscription control");

		let matching: Vec<Uuid> = self
			.entries
			.iter()
			.filter(|(_, queued)| {
				let message = queued.message.lock();
				message.msg_type == MessageType::P2PSub
					&& message.subject == subject
					&& resp_subject
						.as_ref()
						.is_none_or(|rs| message.resp_subject.as_ref() == Some(rs))
					&& target.is_none_or(|t| t == message.id())
			})
			.map(|(id, _)| *id)
			.collect();

		for id in matching {
			let Some(queued) = self.entries.get(&id) else {
				continue;
			};
			{
				let mut message = queued.message.lock();
				message.attachment = Some(control.message.clone());
				message.control = action;
			}
			self.fire(queued);
			{
				let mut message = queued.message.lock();
				message.attachment = None;
				message.control = ControlAction::None;
			}

			match action {
				ControlAction::Cancel => {
					self.order.remove(&id);
					self.entries.remove(&id);
					debug!(%subject, %id, "subscription cancelled");
				},
				ControlAction::Suspend => {
					if let Some(queued) = self.entries.get_mut(&id) {
						queued.suspended = true;
					}
				},
				ControlAction::Resume => {
					if let Some(queued) = self.entries.get_mut(&id) {
						queued.suspended = false;
					}
				},
				_ => {},
			}
		}
	}
}
