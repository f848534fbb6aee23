// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Execution contexts and the cooperative round-robin scheduler
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler, ExecContext, ContextStacks, ContextStatus, StackBounds, install_root(), spawn(),
//!             yield_now(), guard_hit()
//! DEPENDS_ON: arch::aarch64 (switch.S, IRQ masking), mm (stack reservation), preempt (disabled regions),
//!             trap (trap stack selection)
//! INVARIANTS: Exactly one context is Running; the scheduler lock is never held across a stack switch;
//!             the run queue is bounded and rejects deterministically when full;
//!             guard ranges are readable from the fault path without any lock
//!
//! Context 0 is the scheduler root, built by hand over the boot stack. Spawned
//! contexts get a demand-paged stack from the bump region whose lowest page is
//! never mapped: a fault there is a stack overflow, not a page to populate.
//!
//! Each context also owns an always-mapped trap stack. Trap frames are built
//! there, never on the context's own stack, so a syscall that yields leaves its
//! frame in place until the context runs again. The root uses the fixed
//! exception stack; spawned contexts take theirs from the kernel heap.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt;
use core::mem::size_of;
use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;
use static_assertions::const_assert_eq;

use crate::arch::aarch64;
use crate::mm::{self, layout, BumpError, PAGE_SIZE};

/// Identifier of an execution context; the root is 0.
pub type ContextId = usize;

pub const ROOT_CONTEXT: ContextId = 0;
/// Upper bound on contexts waiting in the run queue.
pub const RUN_QUEUE_CAPACITY: usize = 64;
/// Unmapped bytes reserved below each spawned stack.
pub const GUARD_SIZE: usize = PAGE_SIZE;
/// Stack size used by [`spawn`] when the caller passes zero.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;
/// Trap stack per spawned context: room for a syscall handler plus nested fault frames.
pub const TRAP_STACK_SIZE: usize = 32 * 1024;
/// Upper bound on contexts ever created, dead ones included.
pub const MAX_CONTEXTS: usize = 128;

/// Callee-saved state restored by `__context_switch`. Must match `switch.S`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SwitchFrame {
    /// x19..x28.
    pub x: [u64; 10],
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    /// d8..d15.
    pub d: [u64; 8],
}

const_assert_eq!(size_of::<SwitchFrame>(), 168);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextStatus {
    Idle,
    Runnable,
    Running,
    Blocked,
    Dead,
}

/// `[base, top)` of a context stack; `sp` starts at `top`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackBounds {
    pub base: usize,
    pub top: usize,
}

impl StackBounds {
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.top
    }
}

/// Memory a context runs on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextStacks {
    pub stack: StackBounds,
    /// Addresses whose fault means the stack ran past its base.
    pub guard: Range<usize>,
    /// Always mapped; trap frames taken while the context runs go here.
    pub trap: StackBounds,
}

/// Execution context descriptor.
#[derive(Debug)]
pub struct ExecContext {
    pub id: ContextId,
    pub name: &'static str,
    pub stack: StackBounds,
    /// Addresses whose fault means the stack ran past its base.
    pub guard: Range<usize>,
    pub trap_stack: StackBounds,
    pub resume: SwitchFrame,
    pub status: ContextStatus,
    /// Back reference to the scheduler root.
    pub root: ContextId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpawnError {
    QueueFull { capacity: usize },
    TooManyContexts { limit: usize },
    Stack(BumpError),
    NotInstalled,
}

impl From<BumpError> for SpawnError {
    fn from(value: BumpError) -> Self {
        Self::Stack(value)
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull { capacity } => write!(f, "run queue full ({} contexts)", capacity),
            Self::TooManyContexts { limit } => write!(f, "context limit {} reached", limit),
            Self::Stack(err) => write!(f, "stack reservation failed: {}", err),
            Self::NotInstalled => f.write_str("scheduler not installed"),
        }
    }
}

/// What the yield path has to do after `pick_next`.
#[derive(Debug, PartialEq, Eq)]
pub enum Switch {
    /// Keep running the current context.
    Stay,
    /// Nothing can run; wait for an interrupt and retry.
    Idle,
    /// Save into `from`, resume `to` with traps taken on `trap_stack`. Both
    /// frames live in boxed descriptors that are never freed.
    To { from: *mut SwitchFrame, to: *const SwitchFrame, trap_stack: StackBounds },
}

/// Round-robin over boxed descriptors; ids index `contexts`.
pub struct Scheduler {
    contexts: Vec<Box<ExecContext>>,
    queue: VecDeque<ContextId>,
    current: ContextId,
}

// SAFETY: the raw pointers handed out through `Switch` are only used by the
// single core that owns the scheduler lock at the time.
unsafe impl Send for Scheduler {}

impl Scheduler {
    /// Creates the scheduler with the root context already running on `stacks`.
    pub fn new(stacks: ContextStacks) -> Self {
        let root = Box::new(ExecContext {
            id: ROOT_CONTEXT,
            name: "root",
            stack: stacks.stack,
            guard: stacks.guard,
            trap_stack: stacks.trap,
            resume: SwitchFrame::default(),
            status: ContextStatus::Running,
            root: ROOT_CONTEXT,
        });
        let mut contexts = Vec::new();
        contexts.push(root);
        Self { contexts, queue: VecDeque::with_capacity(RUN_QUEUE_CAPACITY), current: ROOT_CONTEXT }
    }

    /// Registers a context whose first activation calls `entry(arg)` on `stacks.stack`.
    pub fn spawn(
        &mut self,
        name: &'static str,
        entry: extern "C" fn(usize),
        arg: usize,
        stacks: ContextStacks,
    ) -> Result<ContextId, SpawnError> {
        if self.queue.len() >= RUN_QUEUE_CAPACITY {
            return Err(SpawnError::QueueFull { capacity: RUN_QUEUE_CAPACITY });
        }
        if self.contexts.len() >= MAX_CONTEXTS {
            return Err(SpawnError::TooManyContexts { limit: MAX_CONTEXTS });
        }
        let id = self.contexts.len();
        let mut resume = SwitchFrame::default();
        resume.x[0] = entry as usize as u64;
        resume.x[1] = arg as u64;
        resume.lr = context_start_address();
        resume.sp = (stacks.stack.top & !0xf) as u64;
        self.contexts.push(Box::new(ExecContext {
            id,
            name,
            stack: stacks.stack,
            guard: stacks.guard,
            trap_stack: stacks.trap,
            resume,
            status: ContextStatus::Runnable,
            root: ROOT_CONTEXT,
        }));
        self.queue.push_back(id);
        Ok(id)
    }

    pub fn current(&self) -> ContextId {
        self.current
    }

    pub fn context(&self, id: ContextId) -> Option<&ExecContext> {
        self.contexts.get(id).map(|c| &**c)
    }

    pub fn status(&self, id: ContextId) -> Option<ContextStatus> {
        self.context(id).map(|c| c.status)
    }

    pub fn has_runnable(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Marks the running context as waiting; it leaves the rotation until [`wake`](Self::wake).
    pub fn block_current(&mut self) {
        self.contexts[self.current].status = ContextStatus::Blocked;
    }

    /// Makes a blocked context runnable again. Returns `false` if it was not blocked.
    pub fn wake(&mut self, id: ContextId) -> bool {
        match self.contexts.get_mut(id) {
            Some(ctx) if ctx.status == ContextStatus::Blocked => {
                if id == self.current {
                    // Blocked but never switched away from; just keep running.
                    ctx.status = ContextStatus::Running;
                } else {
                    ctx.status = ContextStatus::Runnable;
                    self.queue.push_back(id);
                }
                true
            }
            _ => false,
        }
    }

    pub fn exit_current(&mut self) {
        self.contexts[self.current].status = ContextStatus::Dead;
    }

    /// Rotates the run queue.
    pub fn pick_next(&mut self) -> Switch {
        let current = self.current;
        let Some(next) = self.queue.pop_front() else {
            return match self.contexts[current].status {
                ContextStatus::Running => Switch::Stay,
                _ => Switch::Idle,
            };
        };
        if self.contexts[current].status == ContextStatus::Running {
            self.contexts[current].status = ContextStatus::Runnable;
            self.queue.push_back(current);
        }
        self.contexts[next].status = ContextStatus::Running;
        self.current = next;
        let from = &mut self.contexts[current].resume as *mut SwitchFrame;
        let to = &self.contexts[next].resume as *const SwitchFrame;
        Switch::To { from, to, trap_stack: self.contexts[next].trap_stack }
    }
}

/// Guard ranges indexed by context id.
///
/// The fault path may run while the scheduler lock is held by the syscall that
/// faulted, so lookups here take no lock. Entries are published before the
/// context can run and never change afterwards.
pub struct GuardTable {
    start: [AtomicUsize; MAX_CONTEXTS],
    end: [AtomicUsize; MAX_CONTEXTS],
    len: AtomicUsize,
}

impl GuardTable {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY: AtomicUsize = AtomicUsize::new(0);
        Self { start: [EMPTY; MAX_CONTEXTS], end: [EMPTY; MAX_CONTEXTS], len: AtomicUsize::new(0) }
    }

    /// Records `guard` for `id`; ids past [`MAX_CONTEXTS`] are ignored.
    pub fn publish(&self, id: ContextId, guard: &Range<usize>) {
        if id >= MAX_CONTEXTS {
            return;
        }
        self.start[id].store(guard.start, Ordering::Relaxed);
        self.end[id].store(guard.end, Ordering::Release);
        self.len.fetch_max(id + 1, Ordering::Release);
    }

    /// Context whose guard range contains `addr`, if any.
    pub fn hit(&self, addr: usize) -> Option<ContextId> {
        let len = self.len.load(Ordering::Acquire);
        (0..len).find(|&id| {
            let end = self.end[id].load(Ordering::Acquire);
            (self.start[id].load(Ordering::Relaxed)..end).contains(&addr)
        })
    }
}

impl Default for GuardTable {
    fn default() -> Self {
        Self::new()
    }
}

static SCHED: Mutex<Option<Scheduler>> = Mutex::new(None);
static GUARDS: GuardTable = GuardTable::new();

/// Stacks of the root context: the boot stack, the gap below it, and the
/// fixed exception stack for traps.
pub fn root_stacks() -> ContextStacks {
    // The loader's argument area at the top becomes part of the runtime's stack.
    ContextStacks {
        stack: StackBounds { base: layout::BOOT_STACK.base, top: layout::BOOT_STACK.end() },
        guard: layout::KERNEL_DATA.end()..layout::BOOT_STACK.base,
        trap: StackBounds { base: layout::EXCEPTION_STACK.base, top: layout::EXCEPTION_STACK.end() },
    }
}

/// Builds the root context over the boot stack and publishes the scheduler.
pub fn install_root() {
    let stacks = root_stacks();
    GUARDS.publish(ROOT_CONTEXT, &stacks.guard);
    crate::trap::set_trap_stack(stacks.trap.base, stacks.trap.top);
    *SCHED.lock() = Some(Scheduler::new(stacks));
}

/// Runs `f` with the scheduler locked and preemption held off.
pub fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Option<R> {
    let _guard = crate::preempt::disable();
    SCHED.lock().as_mut().map(f)
}

/// Locks the scheduler from trap context, where IRQs are already masked.
pub(crate) fn lock() -> spin::MutexGuard<'static, Option<Scheduler>> {
    SCHED.lock()
}

/// Heap-backed trap stack; the heap is mapped for the kernel's lifetime.
fn alloc_trap_stack() -> StackBounds {
    let memory: &'static mut [u128] = Box::leak(alloc::vec![0u128; TRAP_STACK_SIZE / 16].into_boxed_slice());
    let base = memory.as_mut_ptr() as usize;
    StackBounds { base, top: base + TRAP_STACK_SIZE }
}

/// Reserves a demand-paged stack and queues a new context.
pub fn spawn(
    name: &'static str,
    entry: extern "C" fn(usize),
    arg: usize,
    stack_size: usize,
) -> Result<ContextId, SpawnError> {
    let size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
    let _guard = crate::preempt::disable();
    let base = mm::with_bump(|bump| bump.alloc(size + GUARD_SIZE))?;
    let stacks = ContextStacks {
        stack: StackBounds { base: base + GUARD_SIZE, top: base + GUARD_SIZE + size },
        guard: base..base + GUARD_SIZE,
        trap: alloc_trap_stack(),
    };
    let mut sched = SCHED.lock();
    let sched = sched.as_mut().ok_or(SpawnError::NotInstalled)?;
    let guard = stacks.guard.clone();
    let stack = stacks.stack;
    // Published under the lock, before `pick_next` can ever select the context.
    let id = sched.spawn(name, entry, arg, stacks)?;
    GUARDS.publish(id, &guard);
    crate::log_debug!(target: "sched", "spawn {} id={} stack={:#x}..{:#x}", name, id, stack.base, stack.top);
    Ok(id)
}

/// Id of the running context, or the root before the scheduler exists.
pub fn current_id() -> ContextId {
    SCHED.try_lock().and_then(|s| s.as_ref().map(Scheduler::current)).unwrap_or(ROOT_CONTEXT)
}

/// Fault-path query; takes no lock, so it answers even while a syscall holds the scheduler.
pub fn guard_hit(addr: usize) -> Option<ContextId> {
    GUARDS.hit(addr)
}

/// Gives the core to the next runnable context, if any.
///
/// Runs with IRQs masked; the lock is released before the stack switch. When
/// the current context is blocked and nothing else can run, waits for an
/// interrupt with preemption held off so the idle loop is never diverted.
pub fn yield_now() {
    let was_masked = aarch64::irqs_masked();
    aarch64::mask_irqs();
    loop {
        let switch = match SCHED.lock().as_mut() {
            Some(sched) => sched.pick_next(),
            None => Switch::Stay,
        };
        match switch {
            Switch::Stay => break,
            Switch::To { from, to, trap_stack } => {
                crate::trap::set_trap_stack(trap_stack.base, trap_stack.top);
                // SAFETY: both frames live in boxed descriptors owned by the scheduler.
                unsafe { switch_to(from, to) };
                break;
            }
            Switch::Idle => {
                if cfg!(not(all(target_arch = "aarch64", target_os = "none"))) {
                    break;
                }
                let _guard = crate::preempt::disable();
                aarch64::unmask_irqs();
                aarch64::wait_for_interrupt();
                aarch64::mask_irqs();
            }
        }
    }
    if !was_masked {
        aarch64::unmask_irqs();
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
core::arch::global_asm!(include_str!("../arch/aarch64/switch.S"));

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
extern "C" {
    fn __context_switch(from: *mut SwitchFrame, to: *const SwitchFrame);
    fn __context_start();
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
unsafe fn switch_to(from: *mut SwitchFrame, to: *const SwitchFrame) {
    __context_switch(from, to);
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
unsafe fn switch_to(_from: *mut SwitchFrame, _to: *const SwitchFrame) {}

fn context_start_address() -> u64 {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        __context_start as usize as u64
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        0
    }
}

/// Reached when a spawned entry function returns.
#[no_mangle]
extern "C" fn __context_exit() -> ! {
    aarch64::mask_irqs();
    if let Some(sched) = SCHED.lock().as_mut() {
        sched.exit_current();
    }
    yield_now();
    crate::log_error!(target: "sched", "last context exited");
    aarch64::halt()
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn entry(_arg: usize) {}

    fn root() -> Scheduler {
        Scheduler::new(ContextStacks {
            stack: StackBounds { base: 0x4081_0000, top: 0x4087_0000 },
            guard: 0x4080_f000..0x4081_0000,
            trap: StackBounds { base: 0x4090_0000, top: 0x4094_0000 },
        })
    }

    fn stacks(n: usize) -> ContextStacks {
        let base = 0x4800_0000 + n * 0x2_0000;
        let trap = 0x40a0_0000 + n * TRAP_STACK_SIZE;
        ContextStacks {
            stack: StackBounds { base: base + PAGE_SIZE, top: base + 0x1_1000 },
            guard: base..base + PAGE_SIZE,
            trap: StackBounds { base: trap, top: trap + TRAP_STACK_SIZE },
        }
    }

    #[test]
    fn root_runs_alone() {
        let mut sched = root();
        assert_eq!(sched.current(), ROOT_CONTEXT);
        assert_eq!(sched.pick_next(), Switch::Stay);
        assert_eq!(sched.status(ROOT_CONTEXT), Some(ContextStatus::Running));
    }

    #[test]
    fn round_robin_between_root_and_spawned() {
        let mut sched = root();
        let st = stacks(0);
        let id = sched.spawn("worker", entry, 7, st.clone()).expect("spawn");
        assert_eq!(sched.context(id).map(|c| c.resume.x[1]), Some(7));
        assert_eq!(sched.context(id).map(|c| c.resume.sp), Some(st.stack.top as u64));

        assert!(matches!(sched.pick_next(), Switch::To { .. }));
        assert_eq!(sched.current(), id);
        assert_eq!(sched.status(ROOT_CONTEXT), Some(ContextStatus::Runnable));

        assert!(matches!(sched.pick_next(), Switch::To { .. }));
        assert_eq!(sched.current(), ROOT_CONTEXT);
        assert_eq!(sched.status(id), Some(ContextStatus::Runnable));
    }

    #[test]
    fn switch_carries_the_next_contexts_trap_stack() {
        let mut sched = root();
        let st = stacks(2);
        sched.spawn("worker", entry, 0, st.clone()).expect("spawn");
        match sched.pick_next() {
            Switch::To { trap_stack, .. } => {
                assert_eq!(trap_stack, st.trap);
                // Trap frames never land on the stack the context itself runs on.
                assert!(!st.stack.contains(trap_stack.top - 1));
            }
            other => panic!("expected a switch, got {:?}", other),
        }
        match sched.pick_next() {
            Switch::To { trap_stack, .. } => assert_eq!(trap_stack.base, 0x4090_0000),
            other => panic!("expected a switch, got {:?}", other),
        }
    }

    #[test]
    fn blocked_context_leaves_rotation_until_woken() {
        let mut sched = root();
        let id = sched.spawn("waiter", entry, 0, stacks(0)).expect("spawn");
        sched.pick_next();
        sched.block_current();
        assert!(matches!(sched.pick_next(), Switch::To { .. }));
        assert_eq!(sched.current(), ROOT_CONTEXT);
        assert_eq!(sched.pick_next(), Switch::Stay);

        assert!(sched.wake(id));
        assert!(!sched.wake(id));
        assert!(sched.has_runnable());
    }

    #[test]
    fn idle_when_everything_is_blocked() {
        let mut sched = root();
        sched.block_current();
        assert_eq!(sched.pick_next(), Switch::Idle);
        // Waking the current context before it switched away resumes it in place.
        assert!(sched.wake(ROOT_CONTEXT));
        assert_eq!(sched.pick_next(), Switch::Stay);
    }

    #[test]
    fn dead_contexts_never_return() {
        let mut sched = root();
        let id = sched.spawn("oneshot", entry, 0, stacks(0)).expect("spawn");
        sched.pick_next();
        sched.exit_current();
        sched.pick_next();
        assert_eq!(sched.pick_next(), Switch::Stay);
        assert_eq!(sched.status(id), Some(ContextStatus::Dead));
    }

    #[test]
    fn guard_table_identifies_overflowing_context() {
        let table = GuardTable::new();
        let root = root_stacks();
        let deep = stacks(3);
        table.publish(ROOT_CONTEXT, &root.guard);
        table.publish(3, &deep.guard);
        assert_eq!(table.hit(deep.guard.start + 8), Some(3));
        assert_eq!(table.hit(root.guard.end - 8), Some(ROOT_CONTEXT));
        assert_eq!(table.hit(deep.stack.base), None);
        // Unpublished ids below the high-water mark hold empty ranges.
        assert_eq!(table.hit(0), None);
        table.publish(MAX_CONTEXTS, &(0..usize::MAX));
        assert_eq!(table.hit(0), None);
    }

    #[test]
    fn guard_hit_answers_while_the_scheduler_is_locked() {
        install_root();
        let held = lock();
        assert!(held.is_some());
        let guard = root_stacks().guard;
        assert_eq!(guard_hit(guard.end - 8), Some(ROOT_CONTEXT));
        assert_eq!(guard_hit(layout::BOOT_STACK.base), None);
    }

    #[test]
    fn run_queue_is_bounded() {
        let mut sched = root();
        for n in 0..RUN_QUEUE_CAPACITY {
            sched.spawn("filler", entry, n, stacks(n)).expect("within capacity");
        }
        assert_eq!(
            sched.spawn("overflow", entry, 0, stacks(RUN_QUEUE_CAPACITY)),
            Err(SpawnError::QueueFull { capacity: RUN_QUEUE_CAPACITY })
        );
    }

    #[test]
    fn context_count_is_bounded() {
        let mut sched = root();
        for n in 1..MAX_CONTEXTS {
            sched.spawn("oneshot", entry, n, stacks(n)).expect("within limit");
            sched.pick_next();
            sched.exit_current();
            sched.pick_next();
        }
        assert_eq!(
            sched.spawn("one-too-many", entry, 0, stacks(MAX_CONTEXTS)),
            Err(SpawnError::TooManyContexts { limit: MAX_CONTEXTS })
        );
    }
}
