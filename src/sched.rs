//! The per-core priority scheduler.
//!
//! Each core keeps one FIFO per priority level plus a bitmap of non-empty levels, so the
//! next task is found with a single `trailing_zeros`. Tasks never migrate: a task readied
//! from another core is pushed on the target's handoff list and the target is kicked with
//! an IPI, then moves it to its ready lists itself.

use alloc::sync::Arc;
use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};

use crate::config::WAIT_FOREVER;
use crate::hal::{IpiKind, IrqGuard, KernelHal};
use crate::hook::{HookItem, HookType};
use crate::kernel::Kernel;
use crate::percpu::{CoreId, PcpuState, Timer};
use crate::smp::{CallHandle, SmpCall};
use crate::task::{PendState, Task, TaskId, TaskList, TaskState};

impl<H: KernelHal> Kernel<H> {
    /// Put `task` on its core's ready lists.
    ///
    /// `Ready`/`Running` tasks are left alone. A task that is waiting on an event must be
    /// woken through the event instead, and waking a stopped task is a bug.
    pub fn set_task_ready(&self, from: CoreId, id: TaskId, preempt: bool) -> AxResult {
        let task = self.task(id)?;
        let _irq = IrqGuard::new(&self.hal);
        self.enqueue_ready(from, &task, preempt)
    }

    /// Move a task to `Ready` and link it where its core will find it.
    ///
    /// Called with interrupts disabled. Lock order: event, core-local, handoff list, task.
    pub(crate) fn enqueue_ready(&self, from: CoreId, task: &Arc<Task>, preempt: bool) -> AxResult {
        let target = task.affinity();
        let pcpu = self.pcpu(target)?;
        if target == from {
            let mut local = pcpu.local.lock();
            if !Self::mark_ready(task, TaskList::Ready(target))? {
                return Ok(());
            }
            local.push_back(task.prio(), task.id());
            let current = self.task(local.current)?;
            if preempt && (current.is_idle() || task.prio() < current.prio()) {
                pcpu.set_need_resched(true);
            }
        } else {
            {
                let mut new_list = pcpu.new_list.lock();
                if !Self::mark_ready(task, TaskList::New(target))? {
                    return Ok(());
                }
                new_list.push_back(task.id());
            }
            pcpu.count_ipi_send();
            self.hal.send_ipi(target, IpiKind::IrqWork);
        }
        Ok(())
    }

    /// Returns `Ok(false)` when the task needs no queueing.
    fn mark_ready(task: &Task, list: TaskList) -> AxResult<bool> {
        let mut inner = task.inner.lock();
        match inner.state {
            TaskState::Ready | TaskState::Running => return Ok(false),
            TaskState::Stop => panic!("stopped task {}({}) woken", task.name(), task.id()),
            TaskState::WaitEvent if inner.wait_event.is_some() => {
                return ax_err!(BadState, "task is waiting on an event");
            }
            TaskState::WaitEvent | TaskState::Suspend => {}
        }
        if let Some(old) = inner.list {
            panic!("task {} already on {:?} while readied", task.id(), old);
        }
        // any armed timer belongs to the episode that just ended
        inner.wait_token += 1;
        inner.state = TaskState::Ready;
        inner.list = Some(list);
        Ok(true)
    }

    /// Drain the handoff list of `core` onto its ready lists.
    fn drain_new_list(&self, core: CoreId) -> AxResult {
        let pcpu = self.pcpu(core)?;
        let mut local = pcpu.local.lock();
        let handed: Vec<TaskId> = pcpu.new_list.lock().drain(..).collect();
        let current = self.task(local.current)?;
        for id in handed {
            let task = self.task(id)?;
            {
                let mut inner = task.inner.lock();
                assert_eq!(
                    inner.list,
                    Some(TaskList::New(core)),
                    "task {} on the handoff list of core {} in wrong state",
                    id,
                    core
                );
                inner.list = Some(TaskList::Ready(core));
            }
            local.push_back(task.prio(), id);
            if current.is_idle() || task.prio() < current.prio() {
                pcpu.set_need_resched(true);
            }
        }
        Ok(())
    }

    /// Ask `core` to reschedule.
    pub fn pcpu_resched(&self, core: CoreId) -> AxResult {
        let pcpu = self.pcpu(core)?;
        pcpu.count_ipi_send();
        self.hal.send_ipi(core, IpiKind::Resched);
        Ok(())
    }

    /// Handle an IPI received by `core`.
    pub fn handle_ipi(&self, core: CoreId, kind: IpiKind) -> AxResult {
        let pcpu = self.pcpu(core)?;
        match kind {
            IpiKind::Resched => {
                pcpu.count_ipi_down();
                pcpu.set_need_resched(true);
            }
            IpiKind::IrqWork => {
                pcpu.count_ipi_down();
                let _irq = IrqGuard::new(&self.hal);
                self.drain_new_list(core)?;
            }
            IpiKind::Call => self.handle_smp_calls(core)?,
        }
        Ok(())
    }

    /// The scheduling point of `core`.
    ///
    /// Switches to the highest-priority ready task, or to the idle task when nothing is
    /// ready. Inside an interrupt handler or with preemption disabled the request is
    /// recorded in `need_resched` and carried out later.
    pub fn sched(&self, core: CoreId) -> AxResult {
        let pcpu = self.pcpu(core)?;
        if !pcpu.preemptible() {
            pcpu.set_need_resched(true);
            return Ok(());
        }

        let _irq = IrqGuard::new(&self.hal);
        pcpu.set_need_resched(false);

        let (prev, next) = {
            let mut local = pcpu.local.lock();
            let prev = self.task(local.current)?;
            let (prev_runnable, to_tail) = {
                let mut inner = prev.inner.lock();
                let tail = core::mem::take(&mut inner.requeue_tail);
                (inner.state == TaskState::Running && !prev.is_idle(), tail)
            };

            let next_id = match local.highest_prio() {
                Some(p) if prev_runnable => {
                    if p < prev.prio() || (to_tail && p == prev.prio()) {
                        local.pop(p)
                    } else {
                        None
                    }
                }
                Some(p) => local.pop(p),
                None if prev_runnable => None,
                None if prev.is_idle() => None,
                None => Some(local.idle),
            };
            let Some(next_id) = next_id else {
                return Ok(());
            };
            let next = self.task(next_id)?;
            if next_id == prev.id() {
                // readied again before it got switched out
                let mut inner = prev.inner.lock();
                inner.state = TaskState::Running;
                inner.list = None;
                return Ok(());
            }

            {
                let mut inner = prev.inner.lock();
                if prev.is_idle() {
                    inner.state = TaskState::Ready;
                } else if prev_runnable {
                    inner.state = TaskState::Ready;
                    inner.list = Some(TaskList::Ready(core));
                    if to_tail {
                        local.push_back(prev.prio(), prev.id());
                    } else {
                        local.push_front(prev.prio(), prev.id());
                    }
                }
            }
            {
                let mut inner = next.inner.lock();
                if !next.is_idle() {
                    assert_eq!(
                        inner.list,
                        Some(TaskList::Ready(core)),
                        "task {} picked from a ready list it is not on",
                        next.id()
                    );
                }
                inner.list = None;
                inner.state = TaskState::Running;
                inner.slice_left = self.config.time_slice_ticks;
                inner.ctx_sw_cnt += 1;
            }
            local.current = next_id;
            pcpu.set_state(if next.is_idle() {
                PcpuState::Idle
            } else {
                PcpuState::Running
            });
            (prev, next)
        };

        self.switch_to(core, &prev, &next);
        Ok(())
    }

    fn switch_to(&self, core: CoreId, prev: &Arc<Task>, next: &Arc<Task>) {
        trace!(
            "core {}: switch {}({}) -> {}({})",
            core,
            prev.name(),
            prev.id(),
            next.name(),
            next.id()
        );
        if let Some(vcpu) = prev.vcpu() {
            vcpu.save_contexts(core);
        }
        self.do_hooks(&HookItem::Task { core, task: prev }, HookType::TaskSwitchOut);
        if let Some(vcpu) = next.vcpu() {
            vcpu.restore_contexts(core);
        }
        self.do_hooks(&HookItem::Task { core, task: next }, HookType::TaskSwitchTo);
        // SAFETY: both tasks are bound to `core`, interrupts are disabled, and `prev != next`.
        unsafe {
            self.hal
                .switch_context(core, &mut *prev.context_ptr(), &*next.context_ptr());
        }
    }

    /// Give up the rest of the current time slice.
    pub fn sched_yield(&self, core: CoreId) -> AxResult {
        let current = self.current(core)?;
        current.inner.lock().requeue_tail = true;
        self.sched(core)
    }

    /// Disable preemption on `core`. Nests.
    pub fn preempt_disable(&self, core: CoreId) -> AxResult {
        self.pcpu(core)?.preempt_inc();
        Ok(())
    }

    /// Re-enable preemption; a deferred reschedule runs when the count reaches zero.
    pub fn preempt_enable(&self, core: CoreId) -> AxResult {
        let pcpu = self.pcpu(core)?;
        if pcpu.preempt_dec() == 0 && pcpu.need_resched() && !pcpu.in_interrupt() {
            self.sched(core)?;
        }
        Ok(())
    }

    /// Enter interrupt context on `core`.
    pub fn irq_enter(&self, core: CoreId) -> AxResult {
        self.pcpu(core)?.irq_enter();
        Ok(())
    }

    /// Leave interrupt context on `core`.
    pub fn irq_exit(&self, core: CoreId) -> AxResult {
        self.pcpu(core)?.irq_exit();
        Ok(())
    }

    /// Last step before returning from a trap: honour a pending reschedule.
    pub fn trap_return(&self, core: CoreId) -> AxResult {
        let pcpu = self.pcpu(core)?;
        if pcpu.need_resched() && pcpu.preemptible() {
            self.sched(core)?;
        }
        Ok(())
    }

    /// Error out (and trip a debug assertion) if `core` cannot block right now.
    pub(crate) fn might_sleep(&self, core: CoreId) -> AxResult {
        let pcpu = self.pcpu(core)?;
        if !pcpu.preemptible() {
            debug_assert!(false, "core {}: might sleep in atomic context", core);
            return ax_err!(BadState, "blocking call in atomic context");
        }
        Ok(())
    }

    fn check_current(&self, core: CoreId, id: TaskId) -> AxResult<Arc<Task>> {
        let current = self.current(core)?;
        if current.id() != id || current.is_idle() {
            return ax_err!(PermissionDenied, "only the running task can block itself");
        }
        Ok(current)
    }

    /// Tick at which a timer of `ticks` ticks armed now expires. 0 and [`WAIT_FOREVER`]
    /// arm no timer.
    pub(crate) fn deadline(&self, ticks: u64) -> Option<u64> {
        if ticks == 0 || ticks == WAIT_FOREVER {
            return None;
        }
        Some(self.hal.now_ticks().saturating_add(ticks))
    }

    /// Suspend the current task of `core`. A non-zero `delay` makes it ready again after
    /// that many ticks.
    pub fn set_task_suspend(&self, core: CoreId, id: TaskId, delay: u64) -> AxResult {
        let task = self.check_current(core, id)?;
        let pcpu = self.pcpu(core)?;
        let _irq = IrqGuard::new(&self.hal);
        let mut local = pcpu.local.lock();
        let mut inner = task.inner.lock();
        inner.state = TaskState::Suspend;
        inner.wait_token += 1;
        if let Some(deadline) = self.deadline(delay) {
            local.arm_timer(Timer {
                deadline,
                task: id,
                token: inner.wait_token,
            });
        }
        pcpu.set_need_resched(true);
        Ok(())
    }

    /// Put the current task of `core` to sleep for `ticks` ticks. [`WAIT_FOREVER`] sleeps
    /// until the task is readied explicitly.
    pub fn set_task_sleep(&self, core: CoreId, id: TaskId, ticks: u64) -> AxResult {
        if ticks == 0 {
            return self.sched_yield(core);
        }
        self.might_sleep(core)?;
        let task = self.check_current(core, id)?;
        let pcpu = self.pcpu(core)?;
        {
            let _irq = IrqGuard::new(&self.hal);
            let mut local = pcpu.local.lock();
            let mut inner = task.inner.lock();
            inner.state = TaskState::WaitEvent;
            inner.pend_state = PendState::Ok;
            inner.wait_token += 1;
            if let Some(deadline) = self.deadline(ticks) {
                local.arm_timer(Timer {
                    deadline,
                    task: id,
                    token: inner.wait_token,
                });
            }
        }
        self.sched(core)
    }

    /// Timer tick of `core`: fire expired timers and rotate the time slice.
    pub fn sched_tick(&self, core: CoreId) -> AxResult {
        let pcpu = self.pcpu(core)?;
        let _irq = IrqGuard::new(&self.hal);
        let now = self.hal.now_ticks();

        let expired = pcpu.local.lock().take_expired(now);
        for timer in expired {
            self.fire_timer(core, timer)?;
        }

        let mut local = pcpu.local.lock();
        let current = self.task(local.current)?;
        if current.is_idle() {
            return Ok(());
        }
        let mut inner = current.inner.lock();
        inner.run_ticks += 1;
        inner.slice_left = inner.slice_left.saturating_sub(1);
        if inner.slice_left == 0 {
            inner.slice_left = self.config.time_slice_ticks;
            if local.level_len(current.prio()) > 0 {
                inner.requeue_tail = true;
                pcpu.set_need_resched(true);
            }
        }
        Ok(())
    }

    fn fire_timer(&self, core: CoreId, timer: Timer) -> AxResult {
        let Ok(task) = self.task(timer.task) else {
            return Ok(());
        };
        let event = task.inner.lock().wait_event.clone();
        match event {
            Some(event) => self.event_timeout(core, &event, &task, timer.token),
            None => {
                let expired = {
                    let mut inner = task.inner.lock();
                    let live = inner.wait_token == timer.token
                        && matches!(inner.state, TaskState::WaitEvent | TaskState::Suspend);
                    if live && inner.state == TaskState::WaitEvent {
                        inner.pend_state = PendState::Timeout;
                    }
                    live
                };
                if expired {
                    self.enqueue_ready(core, &task, true)?;
                }
                Ok(())
            }
        }
    }

    /// Finish the current task of `core`. It is parked on the stop list until reaped by
    /// [`Kernel::release_task`].
    pub fn task_exit(&self, core: CoreId) -> AxResult {
        let pcpu = self.pcpu(core)?;
        let current = self.current(core)?;
        if current.is_idle() {
            return ax_err!(BadState, "idle task cannot exit");
        }
        {
            let _irq = IrqGuard::new(&self.hal);
            let mut local = pcpu.local.lock();
            Self::park_stopped(&current, core);
            local.stop_list.push_back(current.id());
        }
        debug!("task {}({}) exit", current.name(), current.id());
        self.sched(core)
    }

    fn park_stopped(task: &Task, core: CoreId) {
        let mut inner = task.inner.lock();
        if let Some(list) = inner.list {
            panic!("task {} stopped while on {:?}", task.id(), list);
        }
        inner.state = TaskState::Stop;
        inner.wait_token += 1;
        inner.list = Some(TaskList::Stop(core));
    }

    /// Reap every stopped task of `core`. Returns how many were released.
    pub fn release_task(&self, core: CoreId) -> AxResult<usize> {
        let pcpu = self.pcpu(core)?;
        let stopped: Vec<TaskId> = {
            let _irq = IrqGuard::new(&self.hal);
            let mut local = pcpu.local.lock();
            let current = local.current;
            let (reap, keep): (Vec<TaskId>, Vec<TaskId>) =
                local.stop_list.drain(..).partition(|&t| t != current);
            local.stop_list.extend(keep);
            reap
        };
        for &id in &stopped {
            if let Ok(task) = self.task(id) {
                task.inner.lock().list = None;
            }
            self.free_task(id);
        }
        Ok(stopped.len())
    }

    /// Stop a task whatever it is doing, and wait until it is stopped.
    ///
    /// Tasks bound to another core are stopped by a message to that core; `ResourceBusy`
    /// means that core never acknowledged it.
    pub fn destroy_task(&self, core: CoreId, id: TaskId) -> AxResult {
        let call = self.stop_task(core, id)?;
        self.wait_smp_calls(&[call])
    }

    /// Post the stop of task `id` to its core.
    pub(crate) fn stop_task(&self, core: CoreId, id: TaskId) -> AxResult<CallHandle> {
        let task = self.task(id)?;
        if task.is_idle() {
            return ax_err!(PermissionDenied, "idle task cannot be destroyed");
        }
        self.smp_call(core, task.affinity(), SmpCall::StopTask(id))
    }

    /// Take a task of `core` out of scheduling, into `Suspend` or `Stop`.
    pub(crate) fn retire_task(&self, core: CoreId, task: &Arc<Task>, to: TaskState) -> AxResult {
        let pcpu = self.pcpu(core)?;
        let event = task.inner.lock().wait_event.clone();
        if let Some(event) = event {
            self.event_remove_waiter(&event, task);
        }

        let _irq = IrqGuard::new(&self.hal);
        let mut local = pcpu.local.lock();
        let mut new_list = pcpu.new_list.lock();
        let is_current = local.current == task.id();
        {
            let mut inner = task.inner.lock();
            match inner.list {
                Some(TaskList::Stop(_)) => return Ok(()),
                Some(TaskList::Ready(_)) => {
                    local.remove(task.prio(), task.id());
                }
                Some(TaskList::New(_)) => new_list.retain(|&t| t != task.id()),
                Some(TaskList::Wait) => panic!("task {} retired while on a wait list", task.id()),
                None => {}
            }
            inner.list = None;
            inner.wait_token += 1;
            inner.state = TaskState::Suspend;
        }
        drop(new_list);
        if to == TaskState::Stop {
            Self::park_stopped(task, core);
            local.stop_list.push_back(task.id());
        }
        if is_current {
            pcpu.set_need_resched(true);
        }
        Ok(())
    }

    /// Ready tasks of `core`, highest priority first, FIFO within a level.
    pub fn ready_tasks(&self, core: CoreId) -> AxResult<Vec<TaskId>> {
        Ok(self.pcpu(core)?.local.lock().ready_snapshot())
    }
}
