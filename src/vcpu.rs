use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, Once};

use crate::percpu::CoreId;
use crate::task::TaskId;
use crate::virq::VirqStruct;
use crate::virq_chip::VirqChip;
use crate::vm::VmId;
use crate::vmodule::VcpuContext;

/// A virtual CPU of a VM.
///
/// The vCPU is run by exactly one task, bound once at VM creation; that task's state is
/// the vCPU's scheduling state. The vCPU itself carries the guest-visible state which has
/// to follow it across switches: its virqs and one context per registered vmodule.
///
/// Note that:
/// - Almost all methods are `&self`; the mutable parts are behind their own locks.
/// - The virq lock is taken with interrupts disabled by the kernel paths that raise virqs.
pub struct Vcpu {
    id: usize,
    vm_id: VmId,
    /// The task running this vcpu and the core it is bound to.
    task: Once<(TaskId, CoreId)>,
    powered: AtomicBool,
    pub(crate) virq: Mutex<VirqStruct>,
    chip: Arc<dyn VirqChip>,
    contexts: Mutex<Vec<Box<dyn VcpuContext>>>,
}

impl Vcpu {
    pub(crate) fn new(
        vm_id: VmId,
        id: usize,
        chip: Arc<dyn VirqChip>,
        nr_spis: u32,
        contexts: Vec<Box<dyn VcpuContext>>,
    ) -> Self {
        Self {
            id,
            vm_id,
            task: Once::new(),
            powered: AtomicBool::new(false),
            virq: Mutex::new(VirqStruct::new(nr_spis, chip.nr_slots())),
            chip,
            contexts: Mutex::new(contexts),
        }
    }

    /// Get the id of the vcpu within its VM.
    pub const fn id(&self) -> usize {
        self.id
    }

    pub const fn vm_id(&self) -> VmId {
        self.vm_id
    }

    /// Get whether the vcpu is the BSP. We always assume the first vcpu (vcpu with id #0) is the BSP.
    pub const fn is_bsp(&self) -> bool {
        self.id == 0
    }

    /// The task running this vcpu.
    pub fn task_id(&self) -> Option<TaskId> {
        self.task.get().map(|&(task, _)| task)
    }

    /// The core the vcpu runs on.
    pub fn affinity(&self) -> Option<CoreId> {
        self.task.get().map(|&(_, core)| core)
    }

    pub(crate) fn bind_task(&self, task: TaskId, core: CoreId) {
        let bound = *self.task.call_once(|| (task, core));
        assert_eq!(bound, (task, core), "vcpu {} bound to two tasks", self.id);
    }

    pub fn chip(&self) -> &Arc<dyn VirqChip> {
        &self.chip
    }

    /// Whether the guest has brought this vcpu up.
    pub fn is_powered(&self) -> bool {
        self.powered.load(Ordering::Acquire)
    }

    pub(crate) fn set_powered(&self, on: bool) {
        self.powered.store(on, Ordering::Release);
    }

    pub(crate) fn save_contexts(&self, core: CoreId) {
        for ctx in self.contexts.lock().iter_mut() {
            ctx.save(core);
        }
    }

    pub(crate) fn restore_contexts(&self, core: CoreId) {
        for ctx in self.contexts.lock().iter() {
            ctx.restore(core);
        }
    }

    pub(crate) fn reset_contexts(&self) {
        for ctx in self.contexts.lock().iter_mut() {
            ctx.reset();
        }
    }
}

impl core::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vcpu")
            .field("vm", &self.vm_id)
            .field("id", &self.id)
            .field("task", &self.task_id())
            .finish()
    }
}
