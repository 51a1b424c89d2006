//! The task descriptor and its state machine.

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::arch::x86_64::kernel::core_local::INVALID_CPU;

/// A test routine: receives its argument, returns its result.
pub type TaskFn = fn(usize) -> u64;

/// Task lifecycle. The only legal walk is straight down; anything else
/// is a kernel bug.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TaskState {
	New = 0,
	Ready = 1,
	Scheduled = 2,
	Running = 3,
	Done = 4,
}

impl TaskState {
	fn from_u8(raw: u8) -> Self {
		match raw {
			0 => Self::New,
			1 => Self::Ready,
			2 => Self::Scheduled,
			3 => Self::Running,
			4 => Self::Done,
			_ => unreachable!(),
		}
	}
}

/// One test task. Occupies the head of its own page so the descriptor
/// address doubles as the allocation handle.
#[derive(Debug)]
pub struct Task {
	pub id: u32,
	/// Task group, for experiments that fan out related work.
	pub group: u32,
	pub name: &'static str,
	pub func: TaskFn,
	pub arg: usize,
	state: AtomicU8,
	/// Owning CPU once scheduled.
	cpu: AtomicU32,
	result: AtomicU64,
}

impl Task {
	pub fn new(id: u32, name: &'static str, func: TaskFn, arg: usize) -> Self {
		Self {
			id,
			group: 0,
			name,
			func,
			arg,
			state: AtomicU8::new(TaskState::New as u8),
			cpu: AtomicU32::new(INVALID_CPU),
			result: AtomicU64::new(0),
		}
	}

	/// Publishes a state transition with a full barrier, so that a
	/// remote CPU polling the state also sees every prior write.
	pub fn set_state(&self, state: TaskState) {
		let current = self.state();
		let legal = matches!(
			(current, state),
			(TaskState::New, TaskState::Ready)
				| (TaskState::Ready, TaskState::Scheduled)
				| (TaskState::Scheduled, TaskState::Running)
				| (TaskState::Running, TaskState::Done)
		);
		assert!(legal, "Illegal task state transition {current:?} -> {state:?}");

		self.state.store(state as u8, Ordering::SeqCst);
	}

	pub fn state(&self) -> TaskState {
		TaskState::from_u8(self.state.load(Ordering::Acquire))
	}

	pub fn cpu(&self) -> u32 {
		self.cpu.load(Ordering::Acquire)
	}

	pub fn set_cpu(&self, cpu: u32) {
		self.cpu.store(cpu, Ordering::SeqCst);
	}

	pub fn result(&self) -> u64 {
		self.result.load(Ordering::Acquire)
	}

	pub fn set_result(&self, result: u64) {
		self.result.store(result, Ordering::SeqCst);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn the_straight_walk_is_legal() {
		let task = Task::new(0, "walk", |_| 0, 0);
		assert_eq!(task.state(), TaskState::New);
		task.set_state(TaskState::Ready);
		task.set_state(TaskState::Scheduled);
		task.set_state(TaskState::Running);
		task.set_state(TaskState::Done);
		assert_eq!(task.state(), TaskState::Done);
	}

	#[test]
	#[should_panic(expected = "Illegal task state transition")]
	fn skipping_a_state_is_a_bug() {
		let task = Task::new(0, "skip", |_| 0, 0);
		task.set_state(TaskState::Scheduled);
	}

	#[test]
	#[should_panic(expected = "Illegal task state transition")]
	fn walking_backwards_is_a_bug() {
		let task = Task::new(0, "back", |_| 0, 0);
		task.set_state(TaskState::Ready);
		task.set_state(TaskState::Scheduled);
		task.set_state(TaskState::Running);
		task.set_state(TaskState::Done);
		task.set_state(TaskState::Running);
	}
}
