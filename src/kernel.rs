use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use axerrno::{ax_err, ax_err_type, AxResult};
use memory_addr::{align_up_4k, VirtAddr};
use spin::RwLock;

use crate::config::{KernelConfig, PRIO_IDLE};
use crate::hal::{IrqGuard, KernelHal};
use crate::hook::{HookItem, HookRegistry, HookType};
use crate::percpu::{CoreId, Pcpu, PcpuState};
use crate::task::{Task, TaskDesc, TaskFlags, TaskId, TaskState};
use crate::vcpu::Vcpu;
use crate::vm::{VmId, VmSlot};
use crate::vmodule::VModule;

/// A passthrough binding of a physical interrupt to a guest virq.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrqBinding {
    pub vm: VmId,
    pub vcpu: usize,
    pub virq: u32,
}

/// The scheduler and virtual interrupt core.
///
/// One `Kernel` owns every per-core context, the task table, the hook registry and the VM
/// table. All entry points take the id of the core they run on explicitly.
pub struct Kernel<H: KernelHal> {
    pub(crate) config: KernelConfig,
    pub(crate) hal: H,
    pub(crate) pcpus: Vec<Pcpu>,
    pub(crate) tasks: RwLock<Vec<Option<Arc<Task>>>>,
    next_affinity: AtomicUsize,
    pub(crate) hooks: HookRegistry,
    pub(crate) vmodules: RwLock<Vec<Arc<dyn VModule>>>,
    pub(crate) vms: RwLock<Vec<VmSlot>>,
    pub(crate) passthrough: RwLock<BTreeMap<u32, IrqBinding>>,
}

impl<H: KernelHal> Kernel<H> {
    /// Build the kernel: one idle task per core and the virq entry/exit hooks.
    pub fn new(config: KernelConfig, hal: H) -> AxResult<Self> {
        config.validate()?;
        log::set_max_level(config.print_level);

        let mut kernel = Self {
            pcpus: Vec::with_capacity(config.nr_cpus),
            tasks: RwLock::new((0..config.max_tasks).map(|_| None).collect()),
            next_affinity: AtomicUsize::new(0),
            hooks: HookRegistry::new(),
            vmodules: RwLock::new(Vec::new()),
            vms: RwLock::new(Vec::new()),
            passthrough: RwLock::new(BTreeMap::new()),
            config,
            hal,
        };

        for core in 0..kernel.config.nr_cpus {
            let mut desc = TaskDesc::new(&format!("idle/{}", core), VirtAddr::from(0), PRIO_IDLE);
            desc.flags = TaskFlags::IDLE;
            let idle = kernel.alloc_task(&desc, core, TaskState::Running, None)?;
            let pcpu = Pcpu::new(core, idle.id());
            pcpu.set_state(PcpuState::Idle);
            kernel.pcpus.push(pcpu);
        }

        crate::virq::register_virq_hooks(&kernel.hooks);
        info!(
            "kernel up: {} cores, {} task slots, slice {} ticks",
            kernel.config.nr_cpus, kernel.config.max_tasks, kernel.config.time_slice_ticks
        );
        Ok(kernel)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn nr_cpus(&self) -> usize {
        self.pcpus.len()
    }

    /// Get the per-core context of `core`.
    pub fn pcpu(&self, core: CoreId) -> AxResult<&Pcpu> {
        self.pcpus
            .get(core)
            .ok_or_else(|| ax_err_type!(InvalidInput, "no such core"))
    }

    /// Look a task up by id.
    pub fn task(&self, id: TaskId) -> AxResult<Arc<Task>> {
        self.tasks
            .read()
            .get(id)
            .and_then(|t| t.clone())
            .ok_or_else(|| ax_err_type!(NotFound, "no such task"))
    }

    /// The task currently running on `core`.
    pub fn current(&self, core: CoreId) -> AxResult<Arc<Task>> {
        let id = self.pcpu(core)?.local.lock().current;
        self.task(id)
    }

    /// The idle task of `core`.
    pub fn idle_task(&self, core: CoreId) -> AxResult<Arc<Task>> {
        let id = self.pcpu(core)?.local.lock().idle;
        self.task(id)
    }

    /// The vCPU run by the current task of `core`, if any.
    pub fn current_vcpu(&self, core: CoreId) -> Option<Arc<Vcpu>> {
        self.current(core).ok()?.vcpu().cloned()
    }

    /// Register a vmodule; vCPUs created afterwards get a context from it.
    pub fn register_vmodule(&self, module: Arc<dyn VModule>) {
        info!("register vmodule {}", module.name());
        self.vmodules.write().push(module);
    }

    /// Register a callback on a hook point. Hooks are meant to be registered at init.
    pub fn register_hook<F>(&self, hook: HookType, f: F)
    where
        F: Fn(&HookItem) -> i32 + Send + Sync + 'static,
    {
        self.hooks.register(hook, f);
    }

    /// Run every callback of `hook` with `item`, returning the sum of their results.
    pub fn do_hooks(&self, item: &HookItem, hook: HookType) -> i32 {
        self.hooks.run(item, hook)
    }

    fn pick_affinity(&self, wanted: Option<CoreId>) -> CoreId {
        match wanted {
            Some(core) if core < self.nr_cpus() => core,
            other => {
                if let Some(core) = other {
                    warn!("affinity {} out of range, using default", core);
                }
                self.next_affinity.fetch_add(1, Ordering::Relaxed) % self.nr_cpus()
            }
        }
    }

    /// Allocate the stack and a table slot and build the control block.
    fn alloc_task(
        &self,
        desc: &TaskDesc,
        affinity: CoreId,
        state: TaskState,
        vcpu: Option<Arc<Vcpu>>,
    ) -> AxResult<Arc<Task>> {
        let size = align_up_4k(if desc.stack_size == 0 {
            self.config.default_stack_size
        } else {
            desc.stack_size
        });
        let base = self
            .hal
            .alloc_stack(size)
            .ok_or_else(|| ax_err_type!(NoMemory, "no memory for task stack"))?;

        let irq = IrqGuard::new(&self.hal);
        let mut tasks = self.tasks.write();
        let Some(slot) = tasks.iter().position(|t| t.is_none()) else {
            drop(tasks);
            drop(irq);
            self.hal.free_stack(base, size);
            return ax_err!(NoMemory, "task table full");
        };
        let task = Arc::new(Task::new(
            slot,
            desc,
            affinity,
            base,
            size,
            state,
            vcpu,
            self.config.time_slice_ticks,
        ));
        tasks[slot] = Some(task.clone());
        Ok(task)
    }

    fn check_prio(prio: u8) -> AxResult {
        if prio >= PRIO_IDLE {
            return ax_err!(
                InvalidInput,
                format!("task priority {} not below the idle priority", prio)
            );
        }
        Ok(())
    }

    /// Create a kernel task and make it ready on its core.
    pub fn create_task(&self, from: CoreId, desc: TaskDesc) -> AxResult<TaskId> {
        Self::check_prio(desc.prio)?;
        if desc.flags.intersects(TaskFlags::IDLE | TaskFlags::VCPU) {
            return ax_err!(InvalidInput, "idle and vcpu tasks are created by the kernel");
        }
        let affinity = self.pick_affinity(desc.affinity);
        let task = self.alloc_task(&desc, affinity, TaskState::Suspend, None)?;
        debug!(
            "create task {}({}) prio {} on core {}",
            task.name(),
            task.id(),
            task.prio(),
            affinity
        );
        self.do_hooks(&HookItem::Task { core: from, task: &task }, HookType::CreateTask);
        self.set_task_ready(from, task.id(), false)?;
        Ok(task.id())
    }

    /// Create the task running `vcpu`. It starts suspended until the vCPU is powered on.
    pub(crate) fn create_vcpu_task(
        &self,
        from: CoreId,
        vcpu: &Arc<Vcpu>,
        name: String,
        prio: u8,
        affinity: Option<CoreId>,
    ) -> AxResult<TaskId> {
        Self::check_prio(prio)?;
        let affinity = self.pick_affinity(affinity);
        let mut desc = TaskDesc::new(&name, VirtAddr::from(0), prio);
        desc.flags = TaskFlags::VCPU;
        let task = self.alloc_task(&desc, affinity, TaskState::Suspend, Some(vcpu.clone()))?;
        vcpu.bind_task(task.id(), affinity);
        self.do_hooks(&HookItem::Task { core: from, task: &task }, HookType::CreateTask);
        Ok(task.id())
    }

    /// Drop a stopped task from the table and free its stack.
    pub(crate) fn free_task(&self, id: TaskId) {
        let taken = {
            let _irq = IrqGuard::new(&self.hal);
            self.tasks.write().get_mut(id).and_then(|t| t.take())
        };
        let Some(task) = taken else {
            return;
        };
        let (base, size) = task.stack();
        self.hal.free_stack(base, size);
        debug!("task {}({}) released", task.name(), id);
    }

    /// Tasks currently in the table, idle tasks included.
    pub fn nr_tasks(&self) -> usize {
        self.tasks.read().iter().filter(|t| t.is_some()).count()
    }
}
