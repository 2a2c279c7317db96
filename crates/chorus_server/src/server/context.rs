#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chorus_domain::Identity;

/// Execution context visible to filters while one inbound frame, or one
/// server-initiated publish, is being processed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
	pub identity: Identity,

	/// Set for work started by the server itself rather than a peer.
	pub internal: bool,
}

impl ExecutionContext {
	/// Context for a frame received from an authenticated peer.
	pub fn inbound(identity: Identity) -> Self {
		Self {
			identity,
			internal: false,
		}
	}

	/// Context for server-initiated work.
	pub fn internal(identity: Identity) -> Self {
		Self {
			identity,
			internal: true,
		}
	}
}

/// Hands out per-unit-of-work context scopes.
///
/// Each scope owns its context slot, so concurrent units never observe each
/// other's context. Dropping a scope clears its slot on every exit path.
#[derive(Debug, Default)]
pub struct ContextManager {
	next_unit: AtomicU64,
	active: AtomicUsize,
}

impl ContextManager {
	pub fn new() -> Self {
		Self::default()
	}

	/// Open a unit of work with no context bound yet.
	pub fn begin(&self) -> ContextScope<'_> {
		let unit = self.next_unit.fetch_add(1, Ordering::Relaxed) + 1;
		self.active.fetch_add(1, Ordering::AcqRel);
		metrics::gauge!("chorus_server_context_scopes_active").increment(1.0);
		ContextScope {
			manager: self,
			unit,
			slot: None,
		}
	}

	/// Open a unit of work and bind `ctx` to it.
	pub fn begin_with(&self, ctx: ExecutionContext) -> ContextScope<'_> {
		let mut scope = self.begin();
		scope.set_context(ctx);
		scope
	}

	pub fn create_empty_context(&self) -> ExecutionContext {
		ExecutionContext::default()
	}

	/// Number of units of work that are still open.
	pub fn active_units(&self) -> usize {
		self.active.load(Ordering::Acquire)
	}
}

/// Context slot of one unit of work.
#[derive(Debug)]
pub struct ContextScope<'a> {
	manager: &'a ContextManager,
	unit: u64,
	slot: Option<ExecutionContext>,
}

impl ContextScope<'_> {
	pub fn unit(&self) -> u64 {
		self.unit
	}

	/// The bound context, creating and binding an empty one if none is set.
	pub fn get_context(&mut self) -> &ExecutionContext {
		let manager = self.manager;
		self.slot.get_or_insert_with(|| manager.create_empty_context())
	}

	pub fn set_context(&mut self, ctx: ExecutionContext) {
		self.slot = Some(ctx);
	}

	pub fn clear_context(&mut self) {
		self.slot = None;
	}

	pub fn is_bound(&self) -> bool {
		self.slot.is_some()
	}
}

impl Drop for ContextScope<'_> {
	fn drop(&mut self) {
		self.slot = None;
		self.manager.active.fetch_sub(1, Ordering::AcqRel);
		metrics::gauge!("chorus_server_context_scopes_active").decrement(1.0);
	}
}
