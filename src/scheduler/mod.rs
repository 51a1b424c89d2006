//! Cooperative task dispatch.
//!
//! Scheduling is single-threaded and cooperative on each CPU: the per-CPU
//! loop picks the task whose owner field names it, runs it to completion,
//! and looks again. There is no preemption and no blocking; ordering
//! between tasks is whatever the test author builds from spin waits and
//! semaphores. A single global flag models cancellation.

pub mod task;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use hermit_sync::InterruptSpinMutex;

pub use self::task::{Task, TaskFn, TaskState};
use crate::errno::Errno;

/// Upper bound on concurrently registered tasks.
const MAX_TASKS: usize = 64;

static TASKS: InterruptSpinMutex<heapless::Vec<&'static Task, MAX_TASKS>> =
	InterruptSpinMutex::new(heapless::Vec::new());

static NEXT_TID: AtomicU32 = AtomicU32::new(0);

/// Checked at every loop iteration; there is no forceful abort.
static TERMINATE: AtomicBool = AtomicBool::new(false);

/// Backs each task with one fresh page, keeping the original page-per-
/// task layout. Hosted builds (unit tests) fall back to the heap.
fn alloc_task_storage() -> Option<&'static mut core::mem::MaybeUninit<Task>> {
	#[cfg(target_os = "none")]
	{
		use crate::mm::{get_free_pages, GfpFlags, PAGE_ORDER_4K};

		let va = get_free_pages(PAGE_ORDER_4K, GfpFlags::KERNEL)?;
		Some(unsafe { &mut *va.as_mut_ptr::<core::mem::MaybeUninit<Task>>() })
	}
	#[cfg(not(target_os = "none"))]
	{
		Some(alloc::boxed::Box::leak(alloc::boxed::Box::new(
			core::mem::MaybeUninit::uninit(),
		)))
	}
}

/// Creates a task and readies it. Duplicate names are rejected, and
/// exhausted page or table space reports out-of-memory.
pub fn new_task(name: &'static str, func: TaskFn, arg: usize) -> Result<&'static Task, Errno> {
	if get_task_by_name(name).is_some() {
		return Err(Errno::Exist);
	}

	let storage = alloc_task_storage().ok_or(Errno::NoMem)?;
	let id = NEXT_TID.fetch_add(1, Ordering::Relaxed);
	let task: &'static Task = storage.write(Task::new(id, name, func, arg));

	task.set_state(TaskState::Ready);

	TASKS.lock().push(task).map_err(|_| Errno::NoMem)?;
	Ok(task)
}

pub fn get_task_by_id(id: u32) -> Option<&'static Task> {
	TASKS.lock().iter().find(|task| task.id == id).copied()
}

pub fn get_task_by_name(name: &str) -> Option<&'static Task> {
	TASKS.lock().iter().find(|task| task.name == name).copied()
}

pub fn get_task_for_cpu(cpu: u32) -> Option<&'static Task> {
	TASKS
		.lock()
		.iter()
		.find(|task| task.cpu() == cpu && task.state() != TaskState::Done)
		.copied()
}

/// Hands a ready task to a CPU. The target CPU's run loop picks it up.
pub fn schedule_task(task: &Task, cpu: u32) {
	#[cfg(target_os = "none")]
	{
		let nr_cpus = crate::arch::x86_64::kernel::core_local::nr_cpus();
		assert!(cpu < nr_cpus, "CPU[{cpu}] does not exist");
	}
	assert_eq!(
		task.state(),
		TaskState::Ready,
		"Scheduling task {} in state {:?}",
		task.name,
		task.state()
	);

	info!("CPU[{cpu}]: scheduling task {}[{}]", task.name, task.id);
	task.set_cpu(cpu);
	task.set_state(TaskState::Scheduled);
}

fn run_task(task: &Task) {
	info!("CPU[{}]: running task {}[{}]", task.cpu(), task.name, task.id);

	task.set_state(TaskState::Running);
	let result = (task.func)(task.arg);
	task.set_result(result);
	task.set_state(TaskState::Done);
}

/// Runs one scheduled task on the calling CPU, outside the run loop.
/// The boot CPU drains its queue this way.
pub fn run_task_inline(task: &Task) {
	run_task(task);
}

/// The per-CPU main loop. Runs whatever is assigned to `cpu` until the
/// terminate flag is raised.
pub fn run_tasks(cpu: u32) {
	loop {
		if let Some(task) = get_task_for_cpu(cpu) {
			if task.state() == TaskState::Scheduled {
				run_task(task);
			}
		}
		if TERMINATE.load(Ordering::Acquire) {
			break;
		}
		core::hint::spin_loop();
	}
}

/// Busy-waits until every registered task is done (or termination is
/// requested).
pub fn wait_for_all_tasks() {
	loop {
		let busy = {
			let tasks = TASKS.lock();
			tasks.iter().any(|task| task.state() != TaskState::Done)
		};
		if !busy || TERMINATE.load(Ordering::Acquire) {
			break;
		}
		core::hint::spin_loop();
	}
}

pub fn terminate() {
	TERMINATE.store(true, Ordering::Release);
}

pub fn is_terminating() -> bool {
	TERMINATE.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
	use super::*;

	// The registries are global; tests share them but use unique names
	// and CPU numbers high enough not to collide.

	#[test]
	fn duplicate_names_are_rejected() {
		new_task("dup", |_| 0, 0).unwrap();
		assert_eq!(new_task("dup", |_| 0, 0), Err(Errno::Exist));
	}

	#[test]
	fn scheduled_task_runs_to_done() {
		let task = new_task("runs", |arg| arg as u64 + 1, 41).unwrap();
		schedule_task(task, 7);

		// Single iteration of what the CPU loop does.
		let picked = get_task_for_cpu(7).unwrap();
		assert_eq!(picked.id, task.id);
		run_task(picked);

		assert_eq!(task.state(), TaskState::Done);
		assert_eq!(task.result(), 42);
		assert!(get_task_for_cpu(7).is_none());
	}

	#[test]
	fn lookup_by_id_and_name_agree() {
		let task = new_task("lookup", |_| 0, 0).unwrap();
		assert_eq!(get_task_by_id(task.id).unwrap().name, "lookup");
		assert_eq!(get_task_by_name("lookup").unwrap().id, task.id);
	}
}
