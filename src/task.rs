use alloc::string::String;
use alloc::sync::Arc;
use core::cell::UnsafeCell;

use bitflags::bitflags;
use memory_addr::VirtAddr;
use spin::Mutex;

use crate::event::{Event, WaitKind};
use crate::percpu::CoreId;
use crate::vcpu::Vcpu;

/// Index of a task in the kernel's task table.
pub type TaskId = usize;

bitflags! {
    /// Static properties of a task.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// The idle task of a core.
        const IDLE = 1 << 0;
        /// The task runs a guest vCPU.
        const VCPU = 1 << 1;
    }
}

/// The state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Created or parked, not eligible to run until made ready.
    Suspend,
    /// On a ready list or on the handoff list of its core.
    Ready,
    /// The current task of its core.
    Running,
    /// Blocked on an event or sleeping, with an optional deadline.
    WaitEvent,
    /// Finished, waiting to be reaped.
    Stop,
}

/// How the last wait of a task ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendState {
    Ok,
    Abort,
    Timeout,
}

/// The container a task is currently linked on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskList {
    /// A ready list of the core.
    Ready(CoreId),
    /// The cross-core handoff list of the core.
    New(CoreId),
    /// The wait list of an event.
    Wait,
    /// The stop list of the core.
    Stop(CoreId),
}

/// Saved general-purpose register state of a task.
#[repr(C)]
#[derive(Clone, Debug, Default)]
pub struct TrapFrame {
    /// `x0` .. `x30`.
    pub gpr: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

impl TrapFrame {
    pub fn set_entry(&mut self, pc: VirtAddr) {
        self.pc = pc.as_usize() as u64;
    }

    pub fn set_stack_top(&mut self, sp: VirtAddr) {
        self.sp = sp.as_usize() as u64;
    }

    pub fn set_arg(&mut self, arg: usize) {
        self.gpr[0] = arg as u64;
    }

    /// Sets the value returned to the task in `x0`.
    pub fn set_return_value(&mut self, val: usize) {
        self.gpr[0] = val as u64;
    }
}

/// Parameters of [`crate::Kernel::create_task`].
#[derive(Debug, Clone)]
pub struct TaskDesc {
    pub name: String,
    pub entry: VirtAddr,
    pub arg: usize,
    /// 0 is the highest priority.
    pub prio: u8,
    /// `None` lets the kernel pick a core round-robin.
    pub affinity: Option<CoreId>,
    /// 0 selects the configured default.
    pub stack_size: usize,
    pub flags: TaskFlags,
}

impl TaskDesc {
    pub fn new(name: &str, entry: VirtAddr, prio: u8) -> Self {
        Self {
            name: String::from(name),
            entry,
            arg: 0,
            prio,
            affinity: None,
            stack_size: 0,
            flags: TaskFlags::empty(),
        }
    }

    pub fn with_affinity(mut self, core: CoreId) -> Self {
        self.affinity = Some(core);
        self
    }

    pub fn with_arg(mut self, arg: usize) -> Self {
        self.arg = arg;
        self
    }
}

/// The mutable part of a [`Task`].
pub struct TaskInner {
    pub(crate) state: TaskState,
    pub(crate) pend_state: PendState,
    pub(crate) wait_event: Option<Arc<Event>>,
    pub(crate) wait_kind: WaitKind,
    /// Bumped at the start of every wait episode; timers carry the value they were armed with.
    pub(crate) wait_token: u64,
    pub(crate) list: Option<TaskList>,
    /// Requeue at the tail of the level on the next switch (yield or used-up slice).
    pub(crate) requeue_tail: bool,
    pub(crate) slice_left: u64,
    pub(crate) run_ticks: u64,
    pub(crate) ctx_sw_cnt: u64,
}

/// A schedulable context bound to one core.
pub struct Task {
    id: TaskId,
    name: String,
    prio: u8,
    affinity: CoreId,
    flags: TaskFlags,
    stack_base: VirtAddr,
    stack_size: usize,
    vcpu: Option<Arc<Vcpu>>,
    pub(crate) inner: Mutex<TaskInner>,
    /// The register context.
    ///
    /// `UnsafeCell` is used because the context must stay reachable while the task is
    /// switched out, so no guard can be held across the switch. Only the owning core
    /// touches it, with interrupts disabled.
    ctx: UnsafeCell<TrapFrame>,
}

// SAFETY: `ctx` is only accessed by the core the task is bound to.
unsafe impl Sync for Task {}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: TaskId,
        desc: &TaskDesc,
        affinity: CoreId,
        stack_base: VirtAddr,
        stack_size: usize,
        state: TaskState,
        vcpu: Option<Arc<Vcpu>>,
        time_slice: u64,
    ) -> Self {
        let mut ctx = TrapFrame::default();
        ctx.set_entry(desc.entry);
        ctx.set_stack_top(stack_base + stack_size);
        ctx.set_arg(desc.arg);
        Self {
            id,
            name: desc.name.clone(),
            prio: desc.prio,
            affinity,
            flags: desc.flags,
            stack_base,
            stack_size,
            vcpu,
            inner: Mutex::new(TaskInner {
                state,
                pend_state: PendState::Ok,
                wait_event: None,
                wait_kind: WaitKind::Event,
                wait_token: 0,
                list: None,
                requeue_tail: false,
                slice_left: time_slice,
                run_ticks: 0,
                ctx_sw_cnt: 0,
            }),
            ctx: UnsafeCell::new(ctx),
        }
    }

    pub const fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn prio(&self) -> u8 {
        self.prio
    }

    /// The core this task is bound to for its whole life.
    pub const fn affinity(&self) -> CoreId {
        self.affinity
    }

    pub const fn flags(&self) -> TaskFlags {
        self.flags
    }

    pub fn is_idle(&self) -> bool {
        self.flags.contains(TaskFlags::IDLE)
    }

    pub fn is_vcpu(&self) -> bool {
        self.flags.contains(TaskFlags::VCPU)
    }

    /// The vCPU run by this task, if it is a vCPU task.
    pub fn vcpu(&self) -> Option<&Arc<Vcpu>> {
        self.vcpu.as_ref()
    }

    pub(crate) fn stack(&self) -> (VirtAddr, usize) {
        (self.stack_base, self.stack_size)
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    pub fn pend_state(&self) -> PendState {
        self.inner.lock().pend_state
    }

    /// The container the task is linked on, if any.
    pub fn list(&self) -> Option<TaskList> {
        self.inner.lock().list
    }

    /// Whether the task has a wait in progress or left over (event or timer bookkeeping).
    pub fn is_waiting(&self) -> bool {
        let inner = self.inner.lock();
        inner.wait_event.is_some() || inner.list == Some(TaskList::Wait)
    }

    /// Number of times the task has been switched to.
    pub fn ctx_sw_cnt(&self) -> u64 {
        self.inner.lock().ctx_sw_cnt
    }

    /// Number of ticks the task was current when the tick fired.
    pub fn run_ticks(&self) -> u64 {
        self.inner.lock().run_ticks
    }

    /// Get the register context of the task.
    ///
    /// # Safety
    /// The caller must run on the task's core with interrupts disabled, and the task must
    /// not be running.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn context_mut(&self) -> &mut TrapFrame {
        unsafe { &mut *self.ctx.get() }
    }

    pub(crate) fn context_ptr(&self) -> *mut TrapFrame {
        self.ctx.get()
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("prio", &self.prio)
            .field("affinity", &self.affinity)
            .finish()
    }
}
