//! Cross-core requests.
//!
//! Work that must run on a specific core (because it touches that core's private state) is
//! posted to the core's mailbox as an [`SmpCall`] and the core is interrupted with
//! [`IpiKind::Call`]. The sender can spin on the returned [`CallHandle`] until the target
//! has run it.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use axerrno::{ax_err, AxResult};

use crate::hal::{IpiKind, KernelHal};
use crate::kernel::Kernel;
use crate::percpu::{CoreId, PcpuState};
use crate::task::{TaskId, TaskState};
use crate::vm::VmId;

/// A request executed on another core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmpCall {
    /// Stop a task bound to the target core.
    StopTask(TaskId),
    /// Park a vCPU of the target core and drop its guest state.
    ResetVcpu { vm: VmId, vcpu: usize },
    /// Mark the target core stopped.
    StopCore,
}

pub(crate) struct SmpMessage {
    call: SmpCall,
    done: Arc<AtomicBool>,
}

/// Completion of a posted [`SmpCall`].
#[derive(Clone)]
pub struct CallHandle {
    done: Arc<AtomicBool>,
}

impl CallHandle {
    pub(crate) fn completed() -> Self {
        Self {
            done: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Spin with exponential backoff until the call ran, for at most `rounds` rounds.
    pub fn wait(&self, rounds: u32) -> AxResult {
        for round in 0..rounds {
            if self.is_done() {
                return Ok(());
            }
            for _ in 0..(1u32 << round.min(10)) {
                core::hint::spin_loop();
            }
        }
        if self.is_done() {
            Ok(())
        } else {
            ax_err!(ResourceBusy, "smp call not acknowledged")
        }
    }
}

impl<H: KernelHal> Kernel<H> {
    /// Run `call` on core `target`. When `target` is the calling core it runs right away.
    pub fn smp_call(&self, from: CoreId, target: CoreId, call: SmpCall) -> AxResult<CallHandle> {
        let pcpu = self.pcpu(target)?;
        if target == from {
            self.run_smp_call(from, call)?;
            return Ok(CallHandle::completed());
        }
        let done = Arc::new(AtomicBool::new(false));
        pcpu.mailbox.lock().push_back(SmpMessage {
            call,
            done: done.clone(),
        });
        self.hal.send_ipi(target, IpiKind::Call);
        Ok(CallHandle { done })
    }

    /// Wait until every call in `calls` ran, spending at most `smp_call_rounds` backoff
    /// rounds on each. Returns `ResourceBusy` if one was never acknowledged.
    pub(crate) fn wait_smp_calls(&self, calls: &[CallHandle]) -> AxResult {
        let mut missing = 0;
        for call in calls {
            if call.wait(self.config.smp_call_rounds).is_err() {
                missing += 1;
            }
        }
        if missing > 0 {
            warn!("{} of {} smp calls not acknowledged", missing, calls.len());
            return ax_err!(ResourceBusy, "smp call not acknowledged");
        }
        Ok(())
    }

    /// Run every call posted to `core`.
    pub(crate) fn handle_smp_calls(&self, core: CoreId) -> AxResult {
        let pcpu = self.pcpu(core)?;
        loop {
            let Some(msg) = pcpu.mailbox.lock().pop_front() else {
                return Ok(());
            };
            if let Err(e) = self.run_smp_call(core, msg.call) {
                warn!("core {}: smp call {:?} failed: {:?}", core, msg.call, e);
            }
            msg.done.store(true, Ordering::Release);
        }
    }

    fn run_smp_call(&self, core: CoreId, call: SmpCall) -> AxResult {
        match call {
            SmpCall::StopTask(id) => {
                let task = self.task(id)?;
                self.retire_task(core, &task, TaskState::Stop)
            }
            SmpCall::ResetVcpu { vm, vcpu } => {
                let vm = self.vm(vm)?;
                self.reset_vcpu(core, &vm, vcpu)
            }
            SmpCall::StopCore => {
                warn!("core {} stopped", core);
                self.pcpu(core)?.set_state(PcpuState::Stopped);
                Ok(())
            }
        }
    }
}
