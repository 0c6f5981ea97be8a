use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use axerrno::{ax_err, ax_err_type, AxResult};
use memory_addr::VirtAddr;
use spin::Mutex;

use crate::hal::{IrqGuard, KernelHal};
use crate::hook::{HookItem, HookType};
use crate::kernel::{IrqBinding, Kernel};
use crate::percpu::CoreId;
use crate::smp::SmpCall;
use crate::task::TaskState;
use crate::vcpu::Vcpu;
use crate::virq::{RaiseOutcome, VirqFlags, VIRQ_NR_LOCAL, VIRQ_NR_SGI};
use crate::virq_chip::{VirqAction, VirqChip};
use crate::vmodule::VcpuContext;

/// Index of a VM in the kernel's VM table.
pub type VmId = usize;

/// Upper bound on the vCPUs of one VM; SGI target lists are carried in a `u64`.
pub const MAX_VCPUS_PER_VM: usize = 64;

/// An entry of the kernel's VM table.
pub(crate) enum VmSlot {
    Free,
    /// Taken by a VM still being created.
    Reserved,
    Live(Arc<Vm>),
}

/// The state of a VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmState {
    /// Created or powered off; not running and not accepting virqs.
    Offline,
    Online,
    /// Suspended by the guest; virqs are latched until resume.
    Suspend,
    /// Being reset.
    Reboot,
}

/// Parameters of [`Kernel::create_vm`].
#[derive(Clone)]
pub struct VmConfig {
    pub name: String,
    pub nr_vcpus: usize,
    /// Number of shared peripheral interrupts, numbered from 32.
    pub nr_spis: u32,
    /// Guest address vCPU 0 starts at.
    pub entry: VirtAddr,
    /// Core of each vCPU; missing entries are placed round-robin.
    pub vcpu_affinity: Vec<CoreId>,
    pub vcpu_prio: u8,
    pub chip: Arc<dyn VirqChip>,
}

impl VmConfig {
    pub fn new(name: &str, nr_vcpus: usize, chip: Arc<dyn VirqChip>) -> Self {
        Self {
            name: String::from(name),
            nr_vcpus,
            nr_spis: 64,
            entry: VirtAddr::from(0x4008_0000),
            vcpu_affinity: Vec::new(),
            vcpu_prio: 10,
            chip,
        }
    }
}

/// A virtual machine: its vCPUs and the interrupt controller they share.
pub struct Vm {
    id: VmId,
    name: String,
    state: Mutex<VmState>,
    vcpus: Vec<Arc<Vcpu>>,
    chip: Arc<dyn VirqChip>,
    nr_spis: u32,
    entry: VirtAddr,
    /// Target vCPU of each SPI.
    spi_route: Mutex<Vec<usize>>,
}

impl Vm {
    pub const fn id(&self) -> VmId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> VmState {
        *self.state.lock()
    }

    pub fn vcpus(&self) -> &[Arc<Vcpu>] {
        &self.vcpus
    }

    pub fn vcpu(&self, id: usize) -> AxResult<&Arc<Vcpu>> {
        self.vcpus
            .get(id)
            .ok_or_else(|| ax_err_type!(InvalidInput, "no such vcpu"))
    }

    pub fn chip(&self) -> &Arc<dyn VirqChip> {
        &self.chip
    }

    pub const fn nr_spis(&self) -> u32 {
        self.nr_spis
    }

    pub const fn entry(&self) -> VirtAddr {
        self.entry
    }

    /// Transition the state of the VM. If the current state is not `from`, return an error.
    pub fn transition_state(&self, from: VmState, to: VmState) -> AxResult {
        self.with_state_transition(from, to, || Ok(()))
    }

    /// Execute a block with the state of the VM transitioned from `from` to `to`. If the
    /// current state is not `from`, return an error.
    ///
    /// The state is left unchanged if the block fails. The state lock is held while the
    /// block runs, so it must not look at the VM state itself.
    pub fn with_state_transition<F, T>(&self, from: VmState, to: VmState, f: F) -> AxResult<T>
    where
        F: FnOnce() -> AxResult<T>,
    {
        let mut state = self.state.lock();
        if *state != from {
            return ax_err!(
                BadState,
                format!("VM state is not {:?}, but {:?}", from, *state)
            );
        }
        let result = f();
        if result.is_ok() {
            *state = to;
        }
        result
    }

    fn set_state(&self, to: VmState) -> VmState {
        core::mem::replace(&mut *self.state.lock(), to)
    }

    /// Route SPI `virq` to vCPU `vcpu`.
    pub fn route_spi(&self, virq: u32, vcpu: usize) -> AxResult {
        self.vcpu(vcpu)?;
        let idx = self.spi_index(virq)?;
        self.spi_route.lock()[idx] = vcpu;
        Ok(())
    }

    /// The vCPU SPI `virq` is routed to.
    pub fn spi_target(&self, virq: u32) -> AxResult<usize> {
        let idx = self.spi_index(virq)?;
        Ok(self.spi_route.lock()[idx])
    }

    fn spi_index(&self, virq: u32) -> AxResult<usize> {
        if virq < VIRQ_NR_LOCAL {
            return ax_err!(InvalidInput, "not a shared virq");
        }
        let idx = (virq - VIRQ_NR_LOCAL) as usize;
        if idx >= self.nr_spis as usize {
            return ax_err!(InvalidInput, format!("virq {} out of range", virq));
        }
        Ok(idx)
    }
}

impl core::fmt::Debug for Vm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl<H: KernelHal> Kernel<H> {
    /// Look a VM up by id.
    pub fn vm(&self, id: VmId) -> AxResult<Arc<Vm>> {
        match self.vms.read().get(id) {
            Some(VmSlot::Live(vm)) => Ok(vm.clone()),
            _ => ax_err!(NotFound, "no such vm"),
        }
    }

    fn set_vm_slot(&self, id: VmId, slot: VmSlot) {
        let _irq = IrqGuard::new(&self.hal);
        if let Some(entry) = self.vms.write().get_mut(id) {
            *entry = slot;
        }
    }

    /// Create a VM with its vCPUs and their tasks. The VM starts `Offline`.
    pub fn create_vm(&self, from: CoreId, config: VmConfig) -> AxResult<Arc<Vm>> {
        if config.nr_vcpus == 0 || config.nr_vcpus > MAX_VCPUS_PER_VM {
            return ax_err!(InvalidInput, "bad vcpu count");
        }
        if config.chip.nr_slots() == 0 {
            return ax_err!(InvalidInput, "virq chip without injection slots");
        }
        let id = {
            let _irq = IrqGuard::new(&self.hal);
            let mut vms = self.vms.write();
            match vms.iter().position(|v| matches!(v, VmSlot::Free)) {
                Some(id) => {
                    vms[id] = VmSlot::Reserved;
                    id
                }
                None => {
                    vms.push(VmSlot::Reserved);
                    vms.len() - 1
                }
            }
        };

        let modules = self.vmodules.read().clone();
        let vcpus: Vec<Arc<Vcpu>> = (0..config.nr_vcpus)
            .map(|vid| {
                let contexts: Vec<Box<dyn VcpuContext>> =
                    modules.iter().map(|m| m.create_context(id, vid)).collect();
                Arc::new(Vcpu::new(id, vid, config.chip.clone(), config.nr_spis, contexts))
            })
            .collect();

        let mut created = Vec::new();
        for vcpu in vcpus.iter() {
            let affinity = config.vcpu_affinity.get(vcpu.id()).copied();
            let name = format!("{}/vcpu{}", config.name, vcpu.id());
            match self.create_vcpu_task(from, vcpu, name, config.vcpu_prio, affinity) {
                Ok(task) => created.push(task),
                Err(e) => {
                    for task in created {
                        self.free_task(task);
                    }
                    self.set_vm_slot(id, VmSlot::Free);
                    return Err(e);
                }
            }
        }

        let vm = Arc::new(Vm {
            id,
            name: config.name.clone(),
            state: Mutex::new(VmState::Offline),
            vcpus,
            chip: config.chip.clone(),
            nr_spis: config.nr_spis,
            entry: config.entry,
            spi_route: Mutex::new(vec![0; config.nr_spis as usize]),
        });
        self.set_vm_slot(id, VmSlot::Live(vm.clone()));
        self.do_hooks(&HookItem::Vm { core: from, vm: &vm }, HookType::CreateVm);
        info!(
            "vm {} ({}) created: {} vcpus, chip {}",
            id,
            vm.name(),
            vm.vcpus().len(),
            vm.chip().name()
        );
        Ok(vm)
    }

    /// Boot a VM: vCPU 0 starts at the VM entry.
    pub fn vm_power_on(&self, from: CoreId, vm_id: VmId) -> AxResult {
        let vm = self.vm(vm_id)?;
        vm.transition_state(VmState::Offline, VmState::Online)?;
        self.vcpu_power_on(from, vm_id, 0, vm.entry(), 0)
    }

    /// Bring up one vCPU of an online VM at `entry`, with `arg` in `x0`.
    pub fn vcpu_power_on(
        &self,
        from: CoreId,
        vm_id: VmId,
        vcpu_id: usize,
        entry: VirtAddr,
        arg: usize,
    ) -> AxResult {
        let vm = self.vm(vm_id)?;
        if vm.state() != VmState::Online {
            return ax_err!(BadState, "vm is not online");
        }
        let vcpu = vm.vcpu(vcpu_id)?;
        if vcpu.is_powered() {
            return ax_err!(AlreadyExists, "vcpu already on");
        }
        let task = self.task(vcpu.task_id().ok_or_else(|| ax_err_type!(BadState))?)?;
        if task.state() != TaskState::Suspend {
            return ax_err!(BadState, "vcpu task is still scheduled");
        }
        // SAFETY: the task is suspended and off every list, nothing else touches its context.
        let ctx = unsafe { task.context_mut() };
        ctx.set_entry(entry);
        ctx.set_arg(arg);
        vcpu.reset_contexts();
        vcpu.set_powered(true);
        debug!("vm {} vcpu {} power on at {:#x}", vm_id, vcpu_id, entry.as_usize());
        self.set_task_ready(from, task.id(), true)
    }

    /// Power off the vCPU the current task of `core` runs.
    pub fn vcpu_power_off(&self, core: CoreId) -> AxResult {
        let task = self.current(core)?;
        let Some(vcpu) = task.vcpu() else {
            return ax_err!(BadState, "current task is not a vcpu");
        };
        vcpu.set_powered(false);
        self.set_task_suspend(core, task.id(), 0)
    }

    /// Suspend a VM: its virqs go offline and the calling vCPU stops.
    ///
    /// Only vCPU 0 of the VM may suspend it, once every other vCPU is off.
    pub fn vm_suspend(&self, core: CoreId, vm_id: VmId) -> AxResult {
        let vm = self.vm(vm_id)?;
        let current = self.current(core)?;
        if !current
            .vcpu()
            .is_some_and(|v| v.vm_id() == vm_id && v.is_bsp())
        {
            return ax_err!(PermissionDenied, "vm can only be suspended by its vcpu 0");
        }
        for vcpu in vm.vcpus().iter().filter(|v| !v.is_bsp()) {
            let stopped = match vcpu.task_id().map(|id| self.task(id)) {
                Some(Ok(task)) => matches!(task.state(), TaskState::Suspend | TaskState::Stop),
                _ => true,
            };
            if vcpu.is_powered() || !stopped {
                return ax_err!(BadState, format!("vcpu {} is still running", vcpu.id()));
            }
        }
        vm.transition_state(VmState::Online, VmState::Suspend)?;
        self.offline_virqs(&vm);
        self.do_hooks(&HookItem::Vm { core, vm: &vm }, HookType::SuspendVm);
        self.set_task_suspend(core, current.id(), 0)?;
        info!("vm {} suspended", vm_id);
        Ok(())
    }

    /// Resume a suspended VM: latched virqs are queued and its powered vCPUs run again.
    pub fn vm_resume(&self, from: CoreId, vm_id: VmId) -> AxResult {
        let vm = self.vm(vm_id)?;
        vm.transition_state(VmState::Suspend, VmState::Online)?;
        for vcpu in vm.vcpus() {
            self.with_virqs(vcpu, |v| v.set_online());
        }
        self.do_hooks(&HookItem::Vm { core: from, vm: &vm }, HookType::ResumeVm);
        for vcpu in vm.vcpus().iter().filter(|v| v.is_powered()) {
            if let Some(task) = vcpu.task_id() {
                if self.task(task)?.state() == TaskState::Suspend {
                    self.set_task_ready(from, task, true)?;
                }
            }
        }
        info!("vm {} resumed", vm_id);
        Ok(())
    }

    /// Reset a VM to its power-on state and boot vCPU 0 again.
    ///
    /// Every vCPU is parked on its own core first. If a core does not acknowledge, the VM
    /// is left in `Reboot` and `ResourceBusy` is returned.
    pub fn vm_reset(&self, core: CoreId, vm_id: VmId) -> AxResult {
        let vm = self.vm(vm_id)?;
        vm.transition_state(VmState::Online, VmState::Reboot)?;
        self.reset_vcpus(core, &vm)?;
        vm.transition_state(VmState::Reboot, VmState::Online)?;
        info!("vm {} reset", vm_id);
        self.vcpu_power_on(core, vm_id, 0, vm.entry(), 0)
    }

    /// Power a VM off; it can be powered on again.
    pub fn vm_power_off(&self, core: CoreId, vm_id: VmId) -> AxResult {
        let vm = self.vm(vm_id)?;
        match vm.set_state(VmState::Offline) {
            VmState::Online | VmState::Suspend => {}
            old => {
                vm.set_state(old);
                return ax_err!(BadState, "vm is not running");
            }
        }
        self.reset_vcpus(core, &vm)?;
        info!("vm {} powered off", vm_id);
        Ok(())
    }

    /// Reset every vCPU of `vm` on the core it is bound to and wait for all of them.
    fn reset_vcpus(&self, core: CoreId, vm: &Vm) -> AxResult {
        let mut calls = Vec::new();
        for vcpu in vm.vcpus() {
            match vcpu.affinity() {
                Some(target) if target != core => calls.push(self.smp_call(
                    core,
                    target,
                    SmpCall::ResetVcpu {
                        vm: vm.id(),
                        vcpu: vcpu.id(),
                    },
                )?),
                _ => self.reset_vcpu(core, vm, vcpu.id())?,
            }
        }
        self.wait_smp_calls(&calls)
    }

    /// Park a vCPU of `core` and drop its guest state.
    pub(crate) fn reset_vcpu(&self, core: CoreId, vm: &Vm, vcpu_id: usize) -> AxResult {
        let vcpu = vm.vcpu(vcpu_id)?;
        let task = self.task(vcpu.task_id().ok_or_else(|| ax_err_type!(BadState))?)?;
        let loaded = self.current(core)?.id() == task.id();
        self.retire_task(core, &task, TaskState::Suspend)?;
        self.with_virqs(vcpu, |v| {
            v.reset(core, vcpu.id(), vcpu.chip().as_ref(), loaded)
        });
        vcpu.reset_contexts();
        vcpu.set_powered(false);
        Ok(())
    }

    /// Take every virq of the VM offline.
    fn offline_virqs(&self, vm: &Vm) {
        for vcpu in vm.vcpus() {
            self.with_virqs(vcpu, |v| v.set_offline());
        }
    }

    /// Destroy a VM: virqs go offline, vCPU tasks stop, passthrough irqs are released.
    ///
    /// The VM stays in the table until every vCPU task has stopped on its core. If a core
    /// does not acknowledge, `ResourceBusy` is returned and the call can be repeated.
    pub fn destroy_vm(&self, core: CoreId, vm_id: VmId) -> AxResult {
        let vm = self.vm(vm_id)?;
        vm.set_state(VmState::Offline);
        self.do_hooks(&HookItem::Vm { core, vm: &vm }, HookType::DestroyVm);
        self.offline_virqs(&vm);
        let mut calls = Vec::new();
        for vcpu in vm.vcpus() {
            vcpu.set_powered(false);
            let Some(task) = vcpu.task_id().and_then(|id| self.task(id).ok()) else {
                continue;
            };
            let owned = task.vcpu().is_some_and(|v| Arc::ptr_eq(v, vcpu));
            if owned && task.state() != TaskState::Stop {
                calls.push(self.stop_task(core, task.id())?);
            }
        }
        self.wait_smp_calls(&calls)?;

        let released: Vec<u32> = {
            let _irq = IrqGuard::new(&self.hal);
            let mut map = self.passthrough.write();
            let hwirqs: Vec<u32> = map
                .iter()
                .filter(|(_, b)| b.vm == vm_id)
                .map(|(&hwirq, _)| hwirq)
                .collect();
            for hwirq in hwirqs.iter() {
                map.remove(hwirq);
            }
            hwirqs
        };
        for hwirq in released {
            self.hal.irq_mask(hwirq);
        }
        self.set_vm_slot(vm_id, VmSlot::Free);
        info!("vm {} destroyed", vm_id);
        Ok(())
    }

    /// Raise shared virq `virq` of a VM on the vCPU it is routed to.
    pub fn send_virq_to_vm(&self, from: CoreId, vm_id: VmId, virq: u32) -> AxResult {
        let vm = self.vm(vm_id)?;
        let vcpu = vm.spi_target(virq)?;
        if self.with_virqs(vm.vcpu(vcpu)?, |v| v.desc(virq).map(|d| d.is_hw()))? {
            return ax_err!(PermissionDenied, "virq is bound to a physical interrupt");
        }
        self.deliver_virq(from, &vm, vcpu, virq, 0)
    }

    /// Raise `virq` on one vCPU. Local virqs (SGI, PPI) are sent this way.
    pub fn send_virq_to_vcpu(&self, from: CoreId, vm_id: VmId, vcpu: usize, virq: u32) -> AxResult {
        let vm = self.vm(vm_id)?;
        if virq >= VIRQ_NR_LOCAL && vm.spi_target(virq)? != vcpu {
            return ax_err!(InvalidInput, "shared virq routed to another vcpu");
        }
        self.deliver_virq(from, &vm, vcpu, virq, 0)
    }

    /// Send SGI `sgi` from vCPU `sender` to every vCPU in `targets`.
    pub fn send_vsgi(
        &self,
        from: CoreId,
        vm_id: VmId,
        sender: usize,
        sgi: u32,
        targets: u64,
    ) -> AxResult {
        if sgi >= VIRQ_NR_SGI {
            return ax_err!(InvalidInput, "not an SGI");
        }
        let vm = self.vm(vm_id)?;
        vm.vcpu(sender)?;
        for vcpu in 0..vm.vcpus().len() {
            if targets & (1 << vcpu) != 0 {
                self.deliver_virq(from, &vm, vcpu, sgi, sender as u8)?;
            }
        }
        Ok(())
    }

    fn deliver_virq(&self, from: CoreId, vm: &Vm, vcpu_id: usize, virq: u32, src: u8) -> AxResult {
        let state = vm.state();
        if matches!(state, VmState::Offline | VmState::Reboot) {
            return ax_err!(BadState, "vm is not running");
        }
        let vcpu = vm.vcpu(vcpu_id)?;
        let (outcome, wakeup) = self.with_virqs(vcpu, |virqs| -> AxResult<_> {
            let outcome = virqs.raise(virq, src)?;
            Ok((outcome, virqs.desc(virq)?.flags.contains(VirqFlags::CAN_WAKEUP)))
        })?;
        match outcome {
            RaiseOutcome::Queued => self.kick_vcpu(from, vcpu),
            RaiseOutcome::AlreadyPending => Ok(()),
            RaiseOutcome::Latched if state == VmState::Suspend && wakeup => {
                self.vm_resume(from, vm.id())
            }
            RaiseOutcome::Latched => ax_err!(WouldBlock, "vm suspended, virq latched"),
        }
    }

    /// Make sure a vCPU notices a newly pending virq.
    fn kick_vcpu(&self, from: CoreId, vcpu: &Vcpu) -> AxResult {
        let Some(id) = vcpu.task_id() else {
            return Ok(());
        };
        let task = self.task(id)?;
        match task.state() {
            TaskState::Suspend if vcpu.is_powered() => self.set_task_ready(from, id, true),
            // force a trap so the entry path injects it
            TaskState::Running if task.affinity() != from => self.pcpu_resched(task.affinity()),
            _ => Ok(()),
        }
    }

    /// Bind physical interrupt `hwirq` to `virq` of a vCPU.
    pub fn bind_passthrough_irq(
        &self,
        core: CoreId,
        vm_id: VmId,
        vcpu_id: usize,
        hwirq: u32,
        virq: u32,
    ) -> AxResult {
        let vm = self.vm(vm_id)?;
        let vcpu = vm.vcpu(vcpu_id)?;
        if virq >= VIRQ_NR_LOCAL && vm.spi_target(virq)? != vcpu_id {
            vm.route_spi(virq, vcpu_id)?;
        }
        {
            let _irq = IrqGuard::new(&self.hal);
            let mut map = self.passthrough.write();
            if map.contains_key(&hwirq) {
                return ax_err!(AlreadyExists, "physical irq already bound");
            }
            vcpu.virq.lock().bind_hw(virq, hwirq)?;
            map.insert(
                hwirq,
                IrqBinding {
                    vm: vm_id,
                    vcpu: vcpu_id,
                    virq,
                },
            );
        }
        let desc = self.with_virqs(vcpu, |v| v.desc(virq).cloned())?;
        vm.chip().update_virq(core, vcpu_id, &desc, VirqAction::Add)?;
        self.hal.irq_unmask(hwirq);
        Ok(())
    }

    /// Drop the binding of physical interrupt `hwirq`.
    pub fn unbind_passthrough_irq(&self, core: CoreId, hwirq: u32) -> AxResult {
        let binding = {
            let _irq = IrqGuard::new(&self.hal);
            self.passthrough.write().remove(&hwirq)
        }
        .ok_or_else(|| ax_err_type!(NotFound, "physical irq not bound"))?;
        self.hal.irq_mask(hwirq);
        let vm = self.vm(binding.vm)?;
        let vcpu = vm.vcpu(binding.vcpu)?;
        let desc = self.with_virqs(vcpu, |v| {
            v.unbind_hw(binding.virq)?;
            v.desc(binding.virq).cloned()
        })?;
        vm.chip()
            .update_virq(core, binding.vcpu, &desc, VirqAction::Remove)
    }

    /// Host path of a physical interrupt that belongs to a guest.
    pub fn handle_guest_irq(&self, core: CoreId, hwirq: u32) -> AxResult {
        let binding = self
            .passthrough
            .read()
            .get(&hwirq)
            .copied()
            .ok_or_else(|| ax_err_type!(NotFound, "no guest bound to the irq"))?;
        let vm = self.vm(binding.vm)?;
        self.deliver_virq(core, &vm, binding.vcpu, binding.virq, 0)
    }
}
