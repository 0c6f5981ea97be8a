use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use spin::Mutex;

use crate::config::NR_PRIO_LEVELS;
use crate::smp::SmpMessage;
use crate::task::TaskId;

/// Index of a physical core inside a [`crate::Kernel`].
pub type CoreId = usize;

/// The run state of a physical core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PcpuState {
    /// The core has not been brought up yet.
    Offline = 0,
    /// The core runs a task other than its idle task.
    Running = 1,
    /// The core runs its idle task.
    Idle = 2,
    /// The core was stopped by a cross-core request.
    Stopped = 3,
}

impl PcpuState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Idle,
            3 => Self::Stopped,
            _ => Self::Offline,
        }
    }
}

/// A pending one-shot timer owned by a core.
///
/// The timer is only acted upon if the task's wait token still equals `token` when it
/// expires, which makes timers of finished wait episodes inert.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Timer {
    pub deadline: u64,
    pub task: TaskId,
    pub token: u64,
}

/// The part of the per-core state only its own core touches.
pub(crate) struct PcpuLocal {
    /// One FIFO per priority level.
    ready: Vec<VecDeque<TaskId>>,
    /// Bit `n` is set iff `ready[n]` is non-empty.
    local_rdy_grp: u64,
    pub current: TaskId,
    pub idle: TaskId,
    pub stop_list: VecDeque<TaskId>,
    pub timers: Vec<Timer>,
}

impl PcpuLocal {
    fn new(idle: TaskId) -> Self {
        Self {
            ready: (0..NR_PRIO_LEVELS).map(|_| VecDeque::new()).collect(),
            local_rdy_grp: 0,
            current: idle,
            idle,
            stop_list: VecDeque::new(),
            timers: Vec::new(),
        }
    }

    pub fn push_back(&mut self, prio: u8, task: TaskId) {
        self.ready[prio as usize].push_back(task);
        self.local_rdy_grp |= 1 << prio;
    }

    pub fn push_front(&mut self, prio: u8, task: TaskId) {
        self.ready[prio as usize].push_front(task);
        self.local_rdy_grp |= 1 << prio;
    }

    /// The highest (numerically lowest) priority with a ready task.
    pub fn highest_prio(&self) -> Option<u8> {
        if self.local_rdy_grp == 0 {
            None
        } else {
            Some(self.local_rdy_grp.trailing_zeros() as u8)
        }
    }

    pub fn pop(&mut self, prio: u8) -> Option<TaskId> {
        let list = &mut self.ready[prio as usize];
        let task = list.pop_front();
        if list.is_empty() {
            self.local_rdy_grp &= !(1 << prio);
        }
        task
    }

    /// Remove `task` from the level `prio`; returns whether it was there.
    pub fn remove(&mut self, prio: u8, task: TaskId) -> bool {
        let list = &mut self.ready[prio as usize];
        let found = match list.iter().position(|&t| t == task) {
            Some(pos) => list.remove(pos).is_some(),
            None => false,
        };
        if list.is_empty() {
            self.local_rdy_grp &= !(1 << prio);
        }
        found
    }

    pub fn level_len(&self, prio: u8) -> usize {
        self.ready[prio as usize].len()
    }

    pub fn ready_snapshot(&self) -> Vec<TaskId> {
        self.ready.iter().flat_map(|l| l.iter().copied()).collect()
    }

    pub fn arm_timer(&mut self, timer: Timer) {
        self.timers.push(timer);
    }

    /// Remove and return every timer whose deadline is not after `now`.
    pub fn take_expired(&mut self, now: u64) -> Vec<Timer> {
        let mut expired = Vec::new();
        self.timers.retain(|t| {
            if t.deadline <= now {
                expired.push(*t);
                false
            } else {
                true
            }
        });
        expired.sort_by_key(|t| t.deadline);
        expired
    }
}

/// The state of one physical core.
///
/// `local` is only ever locked by the owning core, so it is uncontended; other cores hand
/// tasks over through `new_list` and messages through the mailbox, then raise an IPI.
pub struct Pcpu {
    id: CoreId,
    pub(crate) local: Mutex<PcpuLocal>,
    pub(crate) new_list: Mutex<VecDeque<TaskId>>,
    pub(crate) mailbox: Mutex<VecDeque<SmpMessage>>,
    need_resched: AtomicBool,
    preempt_count: AtomicUsize,
    int_nesting: AtomicUsize,
    resched_ipi_send: AtomicU64,
    resched_ipi_down: AtomicU64,
    state: AtomicU8,
}

impl Pcpu {
    pub(crate) fn new(id: CoreId, idle: TaskId) -> Self {
        Self {
            id,
            local: Mutex::new(PcpuLocal::new(idle)),
            new_list: Mutex::new(VecDeque::new()),
            mailbox: Mutex::new(VecDeque::new()),
            need_resched: AtomicBool::new(false),
            preempt_count: AtomicUsize::new(0),
            int_nesting: AtomicUsize::new(0),
            resched_ipi_send: AtomicU64::new(0),
            resched_ipi_down: AtomicU64::new(0),
            state: AtomicU8::new(PcpuState::Offline as u8),
        }
    }

    /// Get the id of the core.
    pub const fn id(&self) -> CoreId {
        self.id
    }

    pub fn state(&self) -> PcpuState {
        PcpuState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: PcpuState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    pub(crate) fn set_need_resched(&self, val: bool) {
        self.need_resched.store(val, Ordering::Release);
    }

    pub fn preempt_count(&self) -> usize {
        self.preempt_count.load(Ordering::Acquire)
    }

    pub(crate) fn preempt_inc(&self) {
        self.preempt_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the count after the decrement.
    pub(crate) fn preempt_dec(&self) -> usize {
        let prev = self.preempt_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "preempt count underflow on core {}", self.id);
        prev - 1
    }

    pub fn in_interrupt(&self) -> bool {
        self.int_nesting.load(Ordering::Acquire) > 0
    }

    pub(crate) fn irq_enter(&self) {
        self.int_nesting.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn irq_exit(&self) -> usize {
        let prev = self.int_nesting.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "interrupt nesting underflow on core {}", self.id);
        prev - 1
    }

    /// Whether the core may switch tasks right now.
    pub fn preemptible(&self) -> bool {
        !self.in_interrupt() && self.preempt_count() == 0
    }

    /// Number of reschedule/irq-work IPIs sent to this core.
    pub fn resched_ipi_send(&self) -> u64 {
        self.resched_ipi_send.load(Ordering::Relaxed)
    }

    /// Number of reschedule/irq-work IPIs this core has handled.
    pub fn resched_ipi_down(&self) -> u64 {
        self.resched_ipi_down.load(Ordering::Relaxed)
    }

    pub(crate) fn count_ipi_send(&self) {
        self.resched_ipi_send.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_ipi_down(&self) {
        self.resched_ipi_down.fetch_add(1, Ordering::Relaxed);
    }
}
