#[cfg(test)]
mod tests {
    use alloc::string::{String, ToString};
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    use axerrno::{AxError, LinuxError};
    use memory_addr::VirtAddr;
    use spin::Mutex;

    use crate::{
        CoreId, EMU_ACK, EMU_ACTIVE, EMU_CTRL, EMU_EOI, EMU_MASK, EMU_PENDING, EMU_SPURIOUS,
        EmulatedVirqChip, Event, GicVersion, GuestExit, HVC_GET_VMID, HVC_VM_SEND_VIRQ, HookItem,
        HVC_SCHED_OUT, HookType, IpiKind, KMutex, Kernel, KernelConfig, KernelHal, ListRegisters,
        MutexPend, PRIO_IDLE, PSCI_CPU_OFF, PSCI_CPU_ON, PSCI_SYSTEM_RESET, PSCI_SYSTEM_SUSPEND,
        PcpuState, PendState, RaiseOutcome, SmpCall, TaskDesc, TaskFlags, TaskId, TaskList,
        TaskState, TrapFrame, Vgic, VirqChip, VirqState, VirqStruct, Vm, VmConfig, VmState,
        WAIT_FOREVER, WaitKind,
    };

    // Mock platform for testing
    struct MockHal {
        ticks: AtomicU64,
        irq_depth: Arc<AtomicUsize>,
        fail_stack: AtomicBool,
        next_stack: AtomicUsize,
        // Track platform calls for testing
        call_log: Mutex<Vec<String>>,
    }

    impl MockHal {
        fn new() -> Self {
            Self {
                ticks: AtomicU64::new(0),
                irq_depth: Arc::new(AtomicUsize::new(0)),
                fail_stack: AtomicBool::new(false),
                next_stack: AtomicUsize::new(0x4000_0000),
                call_log: Mutex::new(Vec::new()),
            }
        }

        fn set_ticks(&self, ticks: u64) {
            self.ticks.store(ticks, Ordering::SeqCst);
        }

        fn logged(&self, entry: &str) -> bool {
            self.call_log.lock().iter().any(|e| e == entry)
        }

        fn logged_prefix(&self, prefix: &str) -> bool {
            self.call_log.lock().iter().any(|e| e.starts_with(prefix))
        }

        fn count_logged(&self, entry: &str) -> usize {
            self.call_log.lock().iter().filter(|e| *e == entry).count()
        }
    }

    impl KernelHal for MockHal {
        fn irq_save(&self) -> usize {
            self.irq_depth.fetch_add(1, Ordering::SeqCst)
        }

        fn irq_restore(&self, _flags: usize) {
            self.irq_depth.fetch_sub(1, Ordering::SeqCst);
        }

        fn send_ipi(&self, target: CoreId, kind: IpiKind) {
            self.call_log
                .lock()
                .push(format!("ipi {} {:?}", target, kind));
        }

        fn now_ticks(&self) -> u64 {
            self.ticks.load(Ordering::SeqCst)
        }

        fn alloc_stack(&self, size: usize) -> Option<VirtAddr> {
            if self.fail_stack.load(Ordering::SeqCst) {
                return None;
            }
            Some(VirtAddr::from(self.next_stack.fetch_add(size, Ordering::SeqCst)))
        }

        fn free_stack(&self, base: VirtAddr, _size: usize) {
            self.call_log
                .lock()
                .push(format!("free_stack {:#x}", base.as_usize()));
        }

        fn switch_context(&self, core: CoreId, _prev: &mut TrapFrame, next: &TrapFrame) {
            self.call_log
                .lock()
                .push(format!("switch {} pc={:#x}", core, next.pc));
        }

        fn irq_mask(&self, hwirq: u32) {
            self.call_log.lock().push(format!("irq_mask {}", hwirq));
        }

        fn irq_unmask(&self, hwirq: u32) {
            self.call_log.lock().push(format!("irq_unmask {}", hwirq));
        }
    }

    // Mock list registers, one bank per core
    struct MockLrs {
        nr: usize,
        regs: Mutex<Vec<Vec<u64>>>,
    }

    impl MockLrs {
        fn new(nr_cores: usize, nr: usize) -> Self {
            Self {
                nr,
                regs: Mutex::new(vec![vec![0; nr]; nr_cores]),
            }
        }
    }

    impl ListRegisters for MockLrs {
        fn nr_lrs(&self) -> usize {
            self.nr
        }

        fn read_lr(&self, core: CoreId, idx: usize) -> u64 {
            self.regs.lock()[core][idx]
        }

        fn write_lr(&self, core: CoreId, idx: usize, val: u64) {
            self.regs.lock()[core][idx] = val;
        }
    }

    fn new_kernel(nr_cpus: usize) -> Kernel<MockHal> {
        Kernel::new(KernelConfig::with_cpus(nr_cpus), MockHal::new()).unwrap()
    }

    fn spawn(kernel: &Kernel<MockHal>, core: CoreId, name: &str, prio: u8) -> TaskId {
        let desc = TaskDesc::new(name, VirtAddr::from(0x8_0000), prio).with_affinity(core);
        kernel.create_task(core, desc).unwrap()
    }

    fn run_next(kernel: &Kernel<MockHal>, core: CoreId) -> TaskId {
        kernel.sched(core).unwrap();
        kernel.current(core).unwrap().id()
    }

    fn current_id(kernel: &Kernel<MockHal>, core: CoreId) -> TaskId {
        kernel.current(core).unwrap().id()
    }

    /// The value the task will see in `x0`.
    fn x0(kernel: &Kernel<MockHal>, id: TaskId) -> u64 {
        let task = kernel.task(id).unwrap();
        unsafe { task.context_mut() }.gpr[0]
    }

    fn errno(err: AxError) -> u64 {
        (-(LinuxError::from(err).code() as i64)) as u64
    }

    fn assert_irqs_restored(kernel: &Kernel<MockHal>) {
        assert_eq!(kernel.hal().irq_depth.load(Ordering::SeqCst), 0);
    }

    /// Create a VM on an emulated chip and power it on. vCPU 0 is left ready on its core.
    fn boot_vm(
        kernel: &Kernel<MockHal>,
        nr_vcpus: usize,
        affinity: Vec<CoreId>,
    ) -> (Arc<Vm>, Arc<EmulatedVirqChip>) {
        let chip = Arc::new(EmulatedVirqChip::new(nr_vcpus, 4));
        let mut config = VmConfig::new("guest", nr_vcpus, chip.clone());
        config.vcpu_affinity = affinity;
        let vm = kernel.create_vm(0, config).unwrap();
        kernel.vm_power_on(0, vm.id()).unwrap();
        (vm, chip)
    }

    /// Bring vCPU 1 up on core 1 from vCPU 0 running on core 0.
    fn start_second_vcpu(kernel: &Kernel<MockHal>, vm: &Vm) -> (TaskId, TaskId) {
        kernel.trap_return(0).unwrap();
        let t0 = vm.vcpu(0).unwrap().task_id().unwrap();
        let t1 = vm.vcpu(1).unwrap().task_id().unwrap();
        assert_eq!(current_id(kernel, 0), t0);
        kernel
            .handle_guest_exit(0, hvc(PSCI_CPU_ON, 1, 0x4010_0000, 0))
            .unwrap();
        assert_eq!(x0(kernel, t0), 0);
        kernel.handle_ipi(1, IpiKind::IrqWork).unwrap();
        kernel.trap_return(1).unwrap();
        assert_eq!(current_id(kernel, 1), t1);
        (t0, t1)
    }

    /// Run `f` on core 0 while another thread acts as core 1 and answers its smp calls.
    fn with_core1_responder<T>(kernel: &Kernel<MockHal>, f: impl FnOnce() -> T) -> T {
        let stop = AtomicBool::new(false);
        let ret = std::thread::scope(|s| {
            s.spawn(|| {
                while !stop.load(Ordering::SeqCst) {
                    kernel.handle_ipi(1, IpiKind::Call).unwrap();
                    std::thread::yield_now();
                }
            });
            let ret = f();
            stop.store(true, Ordering::SeqCst);
            ret
        });
        kernel.trap_return(1).unwrap();
        ret
    }

    fn hvc(nr: u64, a0: u64, a1: u64, a2: u64) -> GuestExit {
        GuestExit::Hypercall {
            nr,
            args: [a0, a1, a2, 0, 0, 0],
        }
    }

    #[test]
    fn test_kernel_config_validation() {
        assert!(matches!(
            Kernel::new(KernelConfig::with_cpus(0), MockHal::new()),
            Err(AxError::InvalidInput)
        ));
        let config = KernelConfig {
            time_slice_ticks: 0,
            ..KernelConfig::with_cpus(2)
        };
        assert!(matches!(
            Kernel::new(config, MockHal::new()),
            Err(AxError::InvalidInput)
        ));

        let kernel = new_kernel(2);
        assert_eq!(kernel.nr_cpus(), 2);
        assert_eq!(kernel.nr_tasks(), 2);
        for core in 0..2 {
            assert!(kernel.current(core).unwrap().is_idle());
            assert_eq!(kernel.pcpu(core).unwrap().state(), PcpuState::Idle);
        }
        assert!(kernel.pcpu(2).is_err());
    }

    #[test]
    fn test_priority_and_fifo_selection() {
        let kernel = new_kernel(1);
        let a = spawn(&kernel, 0, "a", 10);
        let b = spawn(&kernel, 0, "b", 5);
        let c = spawn(&kernel, 0, "c", 10);
        assert_eq!(kernel.ready_tasks(0).unwrap(), vec![b, a, c]);
        assert_eq!(kernel.task(a).unwrap().list(), Some(TaskList::Ready(0)));

        assert_eq!(run_next(&kernel, 0), b);
        assert_eq!(kernel.task(b).unwrap().state(), TaskState::Running);
        assert_eq!(kernel.task(b).unwrap().list(), None);
        assert_eq!(kernel.pcpu(0).unwrap().state(), PcpuState::Running);

        kernel.task_exit(0).unwrap();
        assert_eq!(current_id(&kernel, 0), a);
        assert_eq!(kernel.task(b).unwrap().state(), TaskState::Stop);
        assert_eq!(kernel.task(b).unwrap().list(), Some(TaskList::Stop(0)));

        // yielding goes to the tail of the level
        kernel.sched_yield(0).unwrap();
        assert_eq!(current_id(&kernel, 0), c);
        assert_eq!(kernel.ready_tasks(0).unwrap(), vec![a]);

        assert_eq!(kernel.release_task(0).unwrap(), 1);
        assert!(kernel.task(b).is_err());
        assert!(kernel.hal().logged_prefix("free_stack"));
        assert_irqs_restored(&kernel);
    }

    #[test]
    fn test_preempted_task_requeued_at_head() {
        let kernel = new_kernel(1);
        let a = spawn(&kernel, 0, "a", 10);
        let b = spawn(&kernel, 0, "b", 10);
        assert_eq!(run_next(&kernel, 0), a);

        let high = spawn(&kernel, 0, "high", 5);
        assert_eq!(run_next(&kernel, 0), high);
        assert_eq!(kernel.ready_tasks(0).unwrap(), vec![a, b]);

        // an equal priority task does not preempt
        kernel.task_exit(0).unwrap();
        assert_eq!(current_id(&kernel, 0), a);
        kernel.sched(0).unwrap();
        assert_eq!(current_id(&kernel, 0), a);
        assert_eq!(kernel.task(a).unwrap().ctx_sw_cnt(), 2);
    }

    #[test]
    fn test_preemption_deferred_not_dropped() {
        let kernel = new_kernel(1);
        let low = spawn(&kernel, 0, "low", 10);
        assert_eq!(run_next(&kernel, 0), low);

        kernel.irq_enter(0).unwrap();
        let high = spawn(&kernel, 0, "high", 5);
        kernel.sched(0).unwrap();
        assert_eq!(current_id(&kernel, 0), low);
        assert!(kernel.pcpu(0).unwrap().need_resched());
        kernel.irq_exit(0).unwrap();
        kernel.trap_return(0).unwrap();
        assert_eq!(current_id(&kernel, 0), high);

        let top = spawn(&kernel, 0, "top", 1);
        kernel.preempt_disable(0).unwrap();
        kernel.preempt_disable(0).unwrap();
        kernel.sched(0).unwrap();
        assert_eq!(current_id(&kernel, 0), high);
        kernel.preempt_enable(0).unwrap();
        assert_eq!(current_id(&kernel, 0), high);
        kernel.preempt_enable(0).unwrap();
        assert_eq!(current_id(&kernel, 0), top);
        assert!(!kernel.pcpu(0).unwrap().need_resched());
        assert_irqs_restored(&kernel);
    }

    #[test]
    fn test_create_task_failures() {
        let config = KernelConfig {
            max_tasks: 3,
            ..KernelConfig::with_cpus(1)
        };
        let kernel = Kernel::new(config, MockHal::new()).unwrap();
        let entry = VirtAddr::from(0x8_0000);

        assert_eq!(
            kernel.create_task(0, TaskDesc::new("bad", entry, PRIO_IDLE)),
            Err(AxError::InvalidInput)
        );
        let mut desc = TaskDesc::new("fake-idle", entry, 10);
        desc.flags = TaskFlags::IDLE;
        assert_eq!(kernel.create_task(0, desc), Err(AxError::InvalidInput));

        kernel.hal().fail_stack.store(true, Ordering::SeqCst);
        assert_eq!(
            kernel.create_task(0, TaskDesc::new("t", entry, 10)),
            Err(AxError::NoMemory)
        );
        kernel.hal().fail_stack.store(false, Ordering::SeqCst);

        spawn(&kernel, 0, "t1", 10);
        spawn(&kernel, 0, "t2", 10);
        assert_eq!(
            kernel.create_task(0, TaskDesc::new("t3", entry, 10)),
            Err(AxError::NoMemory)
        );
        assert!(kernel.hal().logged_prefix("free_stack"));
        assert_eq!(kernel.nr_tasks(), 3);
    }

    #[test]
    fn test_out_of_range_affinity_falls_back() {
        let kernel = new_kernel(2);
        let desc = TaskDesc::new("t", VirtAddr::from(0x8_0000), 10).with_affinity(9);
        let id = kernel.create_task(0, desc).unwrap();
        assert!(kernel.task(id).unwrap().affinity() < 2);
    }

    #[test]
    fn test_cross_core_handoff() {
        let kernel = new_kernel(2);
        let t = spawn(&kernel, 0, "local", 10);
        let desc = TaskDesc::new("remote2", VirtAddr::from(0x8_0000), 10).with_affinity(1);
        let r = kernel.create_task(0, desc).unwrap();
        assert_eq!(kernel.task(r).unwrap().list(), Some(TaskList::New(1)));
        assert_eq!(kernel.task(t).unwrap().list(), Some(TaskList::Ready(0)));
        assert!(kernel.hal().logged("ipi 1 IrqWork"));

        let pcpu = kernel.pcpu(1).unwrap();
        assert_eq!(pcpu.resched_ipi_send(), 1);
        assert_eq!(pcpu.resched_ipi_down(), 0);
        assert!(kernel.ready_tasks(1).unwrap().is_empty());

        kernel.handle_ipi(1, IpiKind::IrqWork).unwrap();
        assert_eq!(pcpu.resched_ipi_down(), 1);
        assert_eq!(kernel.task(r).unwrap().list(), Some(TaskList::Ready(1)));
        assert!(pcpu.need_resched());
        kernel.trap_return(1).unwrap();
        assert_eq!(current_id(&kernel, 1), r);

        kernel.pcpu_resched(1).unwrap();
        assert!(kernel.hal().logged("ipi 1 Resched"));
        kernel.handle_ipi(1, IpiKind::Resched).unwrap();
        assert_eq!(pcpu.resched_ipi_send(), pcpu.resched_ipi_down());
        assert_irqs_restored(&kernel);
    }

    #[test]
    fn test_time_slice_rotation() {
        let config = KernelConfig {
            time_slice_ticks: 2,
            ..KernelConfig::with_cpus(1)
        };
        let kernel = Kernel::new(config, MockHal::new()).unwrap();
        let a = spawn(&kernel, 0, "a", 10);
        let b = spawn(&kernel, 0, "b", 10);
        assert_eq!(run_next(&kernel, 0), a);

        kernel.sched_tick(0).unwrap();
        assert!(!kernel.pcpu(0).unwrap().need_resched());
        kernel.sched_tick(0).unwrap();
        assert!(kernel.pcpu(0).unwrap().need_resched());
        kernel.trap_return(0).unwrap();
        assert_eq!(current_id(&kernel, 0), b);
        assert_eq!(kernel.ready_tasks(0).unwrap(), vec![a]);
        assert_eq!(kernel.task(a).unwrap().run_ticks(), 2);

        // alone at its level, the slice just restarts
        kernel.task_exit(0).unwrap();
        assert_eq!(current_id(&kernel, 0), a);
        kernel.sched_tick(0).unwrap();
        kernel.sched_tick(0).unwrap();
        assert!(!kernel.pcpu(0).unwrap().need_resched());
    }

    #[test]
    fn test_sleep_and_delayed_suspend() {
        let kernel = new_kernel(1);
        let t = spawn(&kernel, 0, "sleeper", 10);
        assert_eq!(run_next(&kernel, 0), t);

        kernel.set_task_sleep(0, t, 3).unwrap();
        assert!(kernel.current(0).unwrap().is_idle());
        assert_eq!(kernel.task(t).unwrap().state(), TaskState::WaitEvent);
        kernel.hal().set_ticks(2);
        kernel.sched_tick(0).unwrap();
        assert_eq!(kernel.task(t).unwrap().state(), TaskState::WaitEvent);
        kernel.hal().set_ticks(3);
        kernel.sched_tick(0).unwrap();
        assert_eq!(kernel.task(t).unwrap().state(), TaskState::Ready);
        kernel.trap_return(0).unwrap();
        assert_eq!(current_id(&kernel, 0), t);
        assert_eq!(kernel.event_pend_down(t), Ok(PendState::Timeout));

        kernel.set_task_suspend(0, t, 4).unwrap();
        kernel.trap_return(0).unwrap();
        assert_eq!(kernel.task(t).unwrap().state(), TaskState::Suspend);
        kernel.hal().set_ticks(7);
        kernel.sched_tick(0).unwrap();
        kernel.trap_return(0).unwrap();
        assert_eq!(current_id(&kernel, 0), t);
        assert_eq!(kernel.task(t).unwrap().pend_state(), PendState::Ok);
    }

    #[test]
    fn test_wake_highest_priority_fifo_among_equals() {
        let kernel = new_kernel(1);
        let ev = Event::new();
        let a = spawn(&kernel, 0, "a", 10);
        let b = spawn(&kernel, 0, "b", 10);
        assert_eq!(run_next(&kernel, 0), a);
        kernel.event_task_wait(0, a, &ev, WaitKind::Event, 0).unwrap();
        assert_eq!(current_id(&kernel, 0), b);
        kernel.event_task_wait(0, b, &ev, WaitKind::Event, 0).unwrap();
        let hi = spawn(&kernel, 0, "hi", 5);
        assert_eq!(run_next(&kernel, 0), hi);
        kernel.event_task_wait(0, hi, &ev, WaitKind::Event, 0).unwrap();
        assert!(kernel.current(0).unwrap().is_idle());
        assert_eq!(ev.nr_waiters(), 3);

        assert_eq!(kernel.wake(0, &ev), Ok(hi));
        assert_eq!(kernel.wake(0, &ev), Ok(a));
        assert_eq!(kernel.wake(0, &ev), Ok(b));
        assert_eq!(kernel.wake(0, &ev), Err(AxError::NotFound));
        for id in [a, b, hi] {
            assert_eq!(kernel.event_pend_down(id), Ok(PendState::Ok));
            assert!(!kernel.task(id).unwrap().is_waiting());
        }
        assert_eq!(kernel.ready_tasks(0).unwrap(), vec![hi, a, b]);
        assert_irqs_restored(&kernel);
    }

    #[test]
    fn test_timeout_exclusivity() {
        let kernel = new_kernel(1);
        let ev = Event::new();
        let t = spawn(&kernel, 0, "t", 10);
        assert_eq!(run_next(&kernel, 0), t);
        kernel.event_task_wait(0, t, &ev, WaitKind::Event, 5).unwrap();
        assert!(ev.has_waiter(t));
        assert_eq!(kernel.event_pend_down(t), Err(AxError::BadState));

        kernel.hal().set_ticks(5);
        kernel.sched_tick(0).unwrap();
        assert_eq!(ev.nr_waiters(), 0);
        // the timer won; a late wake finds nobody
        assert_eq!(kernel.wake(0, &ev), Err(AxError::NotFound));
        kernel.trap_return(0).unwrap();
        assert_eq!(current_id(&kernel, 0), t);
        assert_eq!(kernel.event_pend_down(t), Ok(PendState::Timeout));
        assert_eq!(PendState::Timeout.into_result(), Err(AxError::WouldBlock));
        assert!(!kernel.task(t).unwrap().is_waiting());

        // now the wake wins; the stale timer must not touch the next episode
        kernel.event_task_wait(0, t, &ev, WaitKind::Event, 5).unwrap();
        assert_eq!(kernel.wake(0, &ev), Ok(t));
        kernel.hal().set_ticks(20);
        kernel.sched_tick(0).unwrap();
        kernel.trap_return(0).unwrap();
        assert_eq!(current_id(&kernel, 0), t);
        assert_eq!(kernel.event_pend_down(t), Ok(PendState::Ok));
        assert_eq!(kernel.task(t).unwrap().list(), None);
    }

    #[test]
    fn test_abort_waiters() {
        let kernel = new_kernel(1);
        let ev = Event::new();
        let t1 = spawn(&kernel, 0, "w1", 10);
        let t2 = spawn(&kernel, 0, "w2", 10);
        assert_eq!(run_next(&kernel, 0), t1);
        kernel.event_task_wait(0, t1, &ev, WaitKind::Event, 0).unwrap();
        kernel.event_task_wait(0, t2, &ev, WaitKind::Event, 0).unwrap();
        assert_eq!(ev.nr_waiters(), 2);

        // a waiting task is only woken through its event
        assert_eq!(kernel.set_task_ready(0, t1, true), Err(AxError::BadState));
        // only the running task can block itself
        assert_eq!(
            kernel.event_task_wait(0, t1, &ev, WaitKind::Event, 0),
            Err(AxError::PermissionDenied)
        );

        kernel.wake_abort(0, t2).unwrap();
        assert!(!ev.has_waiter(t2));
        assert_eq!(kernel.wake_abort(0, t2), Err(AxError::NotFound));
        assert_eq!(kernel.event_del_always(0, &ev), Ok(1));
        assert_eq!(kernel.event_pend_down(t1), Ok(PendState::Abort));
        assert_eq!(kernel.event_pend_down(t2), Ok(PendState::Abort));
        assert_eq!(PendState::Abort.into_result(), Err(AxError::BadState));
        assert_eq!(kernel.ready_tasks(0).unwrap(), vec![t2, t1]);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "might sleep"))]
    fn test_block_in_irq_context_rejected() {
        let kernel = new_kernel(1);
        let ev = Event::new();
        let t = spawn(&kernel, 0, "t", 10);
        assert_eq!(run_next(&kernel, 0), t);
        kernel.irq_enter(0).unwrap();
        assert_eq!(
            kernel.event_task_wait(0, t, &ev, WaitKind::Event, 0),
            Err(AxError::BadState)
        );
    }

    #[test]
    fn test_mutex_handoff_to_higher_priority() {
        let kernel = new_kernel(1);
        let m = KMutex::new();
        let low = spawn(&kernel, 0, "low", 10);
        assert_eq!(run_next(&kernel, 0), low);
        assert_eq!(kernel.mutex_pend(0, low, &m, 0), Ok(MutexPend::Acquired));
        assert_eq!(kernel.mutex_pend(0, low, &m, 0), Err(AxError::AlreadyExists));

        let high = spawn(&kernel, 0, "high", 5);
        assert_eq!(run_next(&kernel, 0), high);
        assert_eq!(kernel.mutex_accept(0, high, &m), Err(AxError::ResourceBusy));
        assert_eq!(kernel.mutex_pend(0, high, &m, 0), Ok(MutexPend::Blocked));
        assert_eq!(kernel.task(high).unwrap().state(), TaskState::WaitEvent);
        assert_eq!(current_id(&kernel, 0), low);
        assert_eq!(m.event().nr_waiters(), 1);

        // posting from interrupt context is refused
        kernel.irq_enter(0).unwrap();
        assert_eq!(kernel.mutex_post(0, low, &m), Err(AxError::PermissionDenied));
        kernel.irq_exit(0).unwrap();

        kernel.mutex_post(0, low, &m).unwrap();
        assert_eq!(current_id(&kernel, 0), high);
        assert_eq!(m.owner(), Some(high));
        assert_eq!(kernel.mutex_pend_result(high), Ok(()));
        assert_eq!(kernel.ready_tasks(0).unwrap(), vec![low]);

        assert_eq!(kernel.mutex_post(0, low, &m), Err(AxError::PermissionDenied));
        kernel.mutex_post(0, high, &m).unwrap();
        assert_eq!(m.owner(), None);
        assert_eq!(kernel.mutex_accept(0, high, &m), Ok(()));
        assert_irqs_restored(&kernel);
    }

    #[test]
    fn test_hooks_run_in_order_and_sum() {
        let kernel = new_kernel(1);
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        kernel.register_hook(HookType::TaskSwitchTo, move |item| {
            if let HookItem::Task { task, .. } = item {
                log.lock().push(task.name().to_string());
            }
            0
        });
        kernel.register_hook(HookType::CreateVm, |_| 1);
        kernel.register_hook(HookType::CreateVm, |_| 2);
        assert_eq!(kernel.hooks.len(HookType::CreateVm), 2);
        assert_eq!(kernel.hooks.len(HookType::EnterToGuest), 1);
        assert_eq!(kernel.hooks.len(HookType::ExitFromGuest), 1);

        let a = spawn(&kernel, 0, "a", 10);
        assert_eq!(run_next(&kernel, 0), a);
        kernel.task_exit(0).unwrap();
        assert_eq!(*seen.lock(), vec!["a".to_string(), "idle/0".to_string()]);

        let chip = Arc::new(EmulatedVirqChip::new(1, 4));
        let vm = kernel
            .create_vm(0, VmConfig::new("hooked", 1, chip))
            .unwrap();
        assert_eq!(
            kernel.do_hooks(&HookItem::Vm { core: 0, vm: &vm }, HookType::CreateVm),
            3
        );
    }

    #[test]
    fn test_virq_raised_while_vcpu_not_running() {
        let kernel = new_kernel(1);
        let (vm, chip) = boot_vm(&kernel, 1, vec![0]);
        assert_eq!(vm.state(), VmState::Online);
        kernel.trap_return(0).unwrap();
        kernel.enter_guest(0).unwrap();
        let vcpu = vm.vcpu(0).unwrap().clone();
        let task = vcpu.task_id().unwrap();
        assert_eq!(current_id(&kernel, 0), task);
        assert!(kernel.hal().logged("switch 0 pc=0x40080000"));

        kernel
            .handle_guest_exit(0, GuestExit::WaitForInterrupt)
            .unwrap();
        assert_eq!(kernel.task(task).unwrap().state(), TaskState::Suspend);
        assert!(kernel.current(0).unwrap().is_idle());

        kernel.send_virq_to_vm(0, vm.id(), 40).unwrap();
        assert_eq!(kernel.virq_state(&vcpu, 40), Ok(VirqState::Pending));
        assert_eq!(kernel.task(task).unwrap().state(), TaskState::Ready);
        assert!(!chip.irq_line(0));

        kernel.trap_return(0).unwrap();
        kernel.enter_guest(0).unwrap();
        assert_eq!(current_id(&kernel, 0), task);
        assert_eq!(kernel.virq_state(&vcpu, 40), Ok(VirqState::Active));
        assert!(chip.irq_line(0));

        assert_eq!(chip.mmio_read(0, EMU_ACK), Ok(40));
        chip.mmio_write(0, EMU_EOI, 40).unwrap();
        assert!(!chip.irq_line(0));
        kernel.handle_guest_exit(0, GuestExit::Nothing).unwrap();
        assert_eq!(kernel.virq_state(&vcpu, 40), Ok(VirqState::Inactive));
        assert_eq!(kernel.with_virqs(&vcpu, |v| v.slots_in_use()), 0);
        assert_irqs_restored(&kernel);
    }

    #[test]
    fn test_virq_reraised_while_active_is_redelivered() {
        let kernel = new_kernel(1);
        let (vm, chip) = boot_vm(&kernel, 1, vec![0]);
        kernel.trap_return(0).unwrap();
        let vcpu = vm.vcpu(0).unwrap().clone();

        kernel.send_virq_to_vcpu(0, vm.id(), 0, 20).unwrap();
        kernel.enter_guest(0).unwrap();
        assert_eq!(chip.mmio_read(0, EMU_ACK), Ok(20));
        kernel.send_virq_to_vcpu(0, vm.id(), 0, 20).unwrap();
        assert_eq!(kernel.virq_state(&vcpu, 20), Ok(VirqState::ActiveAndPending));
        chip.mmio_write(0, EMU_EOI, 20).unwrap();

        kernel.handle_guest_exit(0, GuestExit::Nothing).unwrap();
        assert_eq!(kernel.virq_state(&vcpu, 20), Ok(VirqState::Active));
        assert_eq!(chip.mmio_read(0, EMU_ACK), Ok(20));
    }

    #[test]
    fn test_slot_exhaustion_defers() {
        let chip = EmulatedVirqChip::new(1, 2);
        let mut virqs = VirqStruct::new(32, chip.nr_slots());
        for vno in [40, 41, 42] {
            assert_eq!(virqs.raise(vno, 0), Ok(RaiseOutcome::Queued));
        }
        assert_eq!(virqs.raise(41, 0), Ok(RaiseOutcome::AlreadyPending));

        virqs.enter(0, 0, &chip);
        assert_eq!(virqs.active_virqs(), vec![40, 41]);
        assert_eq!(virqs.pending_virqs(), vec![42]);
        assert_eq!(virqs.desc(40).unwrap().id, Some(0));
        assert_eq!(virqs.desc(41).unwrap().id, Some(1));
        assert_eq!(virqs.desc(42).unwrap().id, None);

        assert_eq!(chip.mmio_read(0, EMU_ACK), Ok(40));
        chip.mmio_write(0, EMU_EOI, 40).unwrap();
        virqs.exit(0, 0, &chip);
        assert_eq!(virqs.state(40), Ok(VirqState::Inactive));
        // 41 was never taken by the guest and goes back for re-delivery
        assert_eq!(virqs.pending_virqs(), vec![42, 41]);
        assert!(virqs.active_virqs().is_empty());
        assert_eq!(virqs.slots_in_use(), 0);

        virqs.enter(0, 0, &chip);
        assert_eq!(virqs.active_virqs(), vec![42, 41]);
        assert_eq!(virqs.slots_in_use(), 2);
        assert_eq!(virqs.raise(64, 0), Err(AxError::InvalidInput));
    }

    #[test]
    fn test_mask_and_clear_idempotent() {
        let chip = EmulatedVirqChip::new(1, 4);
        let mut virqs = VirqStruct::new(32, 4);
        virqs.raise(50, 0).unwrap();
        virqs.mask(50).unwrap();
        virqs.mask(50).unwrap();
        assert!(!virqs.desc(50).unwrap().is_enabled());
        assert!(!virqs.has_pending());

        virqs.enter(0, 0, &chip);
        assert!(virqs.active_virqs().is_empty());
        assert_eq!(virqs.pending_virqs(), vec![50]);

        virqs.unmask(50).unwrap();
        virqs.unmask(50).unwrap();
        assert!(virqs.has_pending());
        virqs.enter(0, 0, &chip);
        assert_eq!(virqs.active_virqs(), vec![50]);

        virqs.raise(51, 0).unwrap();
        virqs.clear_pending(51).unwrap();
        virqs.clear_pending(51).unwrap();
        assert_eq!(virqs.state(51), Ok(VirqState::Inactive));
        assert_eq!(virqs.pending_virqs(), Vec::<u32>::new());
        virqs.clear_pending(60).unwrap();
    }

    #[test]
    fn test_emulated_chip_registers() {
        let chip = EmulatedVirqChip::new(1, 4);
        assert_eq!(chip.mmio_read(0, EMU_ACK), Ok(EMU_SPURIOUS));
        assert_eq!(
            chip.mmio_write(0, EMU_PENDING, 1),
            Err(AxError::PermissionDenied)
        );
        assert_eq!(chip.mmio_read(0, 0x100), Err(AxError::InvalidInput));
        assert_eq!(chip.mmio_read(1, EMU_CTRL), Err(AxError::InvalidInput));

        let mut virqs = VirqStruct::new(32, 4);
        virqs.raise(33, 0).unwrap();
        virqs.raise(34, 0).unwrap();
        virqs.enter(0, 0, &chip);
        assert!(chip.irq_line(0));

        chip.mmio_write(0, EMU_MASK, 0b1).unwrap();
        assert_eq!(chip.mmio_read(0, EMU_ACK), Ok(34));
        assert_eq!(chip.mmio_read(0, EMU_ACTIVE), Ok(0b10));
        assert_eq!(chip.mmio_read(0, EMU_PENDING), Ok(0b01));
        chip.mmio_write(0, EMU_CTRL, 0).unwrap();
        assert!(!chip.irq_line(0));
        chip.mmio_write(0, EMU_CTRL, 1).unwrap();
        assert!(chip.irq_line(0));
        chip.mmio_write(0, EMU_EOI, 34).unwrap();
        assert!(!chip.irq_line(0));

        virqs.exit(0, 0, &chip);
        assert_eq!(virqs.state(34), Ok(VirqState::Inactive));
        assert_eq!(virqs.pending_virqs(), vec![33]);
        assert_eq!(chip.mmio_read(0, EMU_PENDING), Ok(0));

        assert_eq!(chip.xlate(&[1, 3]), Ok((35, 0)));
        assert_eq!(chip.xlate(&[1, 40]), Err(AxError::InvalidInput));
    }

    #[test]
    fn test_gic_lr_encodings() {
        let mut virqs = VirqStruct::new(32, 4);
        virqs.raise(3, 2).unwrap();
        virqs.bind_hw(41, 72).unwrap();
        let spi = virqs.desc(40).unwrap().clone();
        let sgi = virqs.desc(3).unwrap().clone();
        let mut hw = virqs.desc(41).unwrap().clone();
        hw.vno = 40;

        let v2 = GicVersion::V2;
        assert_eq!(v2.encode_lr(&spi, VirqState::Pending), 0x5a00_0028);
        assert_eq!(v2.encode_lr(&hw, VirqState::Pending), 0xda01_2028);
        assert_eq!(v2.encode_lr(&sgi, VirqState::Pending), 0x5a00_0803);
        assert_eq!(v2.lr_state(0x5a00_0028), VirqState::Pending);
        assert_eq!(v2.lr_vintid(0xda01_2028), 40);

        let v3 = GicVersion::V3;
        assert_eq!(v3.encode_lr(&spi, VirqState::Pending), 0x50a0_0000_0000_0028);
        assert_eq!(v3.encode_lr(&hw, VirqState::Pending), 0x70a0_0048_0000_0028);
        assert_eq!(v3.encode_lr(&spi, VirqState::Active), 0x90a0_0000_0000_0028);
        assert_eq!(v3.lr_state(0x90a0_0000_0000_0028), VirqState::Active);
        assert_eq!(v3.lr_state(0), VirqState::Inactive);

        let vgic = Vgic::new(GicVersion::V2, Arc::new(MockLrs::new(1, 4)));
        assert_eq!(vgic.name(), "vgicv2");
        assert_eq!(vgic.xlate(&[0, 8, 4]), Ok((40, 4)));
        assert_eq!(vgic.xlate(&[1, 11]), Ok((27, 0)));
        assert_eq!(vgic.xlate(&[1, 20, 0]), Err(AxError::InvalidInput));
    }

    #[test]
    fn test_vgic_list_registers_follow_vcpu() {
        let kernel = new_kernel(1);
        let lrs = Arc::new(MockLrs::new(1, 4));
        let vgic = Arc::new(Vgic::new(GicVersion::V3, lrs.clone()));
        kernel.register_vmodule(vgic.lr_module());
        let mut config = VmConfig::new("gicv3", 1, vgic.clone());
        config.vcpu_affinity = vec![0];
        let vm = kernel.create_vm(0, config).unwrap();
        kernel.vm_power_on(0, vm.id()).unwrap();
        kernel.trap_return(0).unwrap();

        kernel.send_virq_to_vm(0, vm.id(), 40).unwrap();
        kernel.enter_guest(0).unwrap();
        let vcpu = vm.vcpu(0).unwrap().clone();
        let desc = kernel.with_virqs(&vcpu, |v| v.desc(40).cloned()).unwrap();
        assert_eq!(desc.id, Some(0));
        assert_eq!(lrs.read_lr(0, 0), GicVersion::V3.encode_lr(&desc, VirqState::Pending));

        // the guest acknowledges, then a host task preempts the vcpu
        let active = GicVersion::V3.encode_lr(&desc, VirqState::Active);
        lrs.write_lr(0, 0, active);
        let host = spawn(&kernel, 0, "host", 5);
        kernel.pcpu_resched(0).unwrap();
        kernel.handle_ipi(0, IpiKind::Resched).unwrap();
        kernel.handle_guest_exit(0, GuestExit::Nothing).unwrap();
        assert_eq!(current_id(&kernel, 0), host);
        assert_eq!(kernel.virq_state(&vcpu, 40), Ok(VirqState::Active));
        assert_eq!(lrs.read_lr(0, 0), 0);

        kernel.task_exit(0).unwrap();
        assert_eq!(kernel.current_vcpu(0).unwrap().id(), 0);
        assert_eq!(lrs.read_lr(0, 0), active);

        // end of interrupt
        lrs.write_lr(0, 0, 0);
        kernel.handle_guest_exit(0, GuestExit::Nothing).unwrap();
        assert_eq!(kernel.virq_state(&vcpu, 40), Ok(VirqState::Inactive));
        assert_eq!(kernel.with_virqs(&vcpu, |v| v.slots_in_use()), 0);
    }

    #[test]
    fn test_hypercall_injection() {
        let kernel = new_kernel(1);
        let (vm, chip) = boot_vm(&kernel, 1, vec![0]);
        kernel.trap_return(0).unwrap();
        let vcpu = vm.vcpu(0).unwrap().clone();
        let t = vcpu.task_id().unwrap();

        kernel
            .handle_guest_exit(0, hvc(HVC_VM_SEND_VIRQ, vm.id() as u64, 45, 0))
            .unwrap();
        assert_eq!(x0(&kernel, t), 0);
        assert_eq!(kernel.virq_state(&vcpu, 45), Ok(VirqState::Active));
        assert!(chip.irq_line(0));

        kernel
            .handle_guest_exit(0, hvc(HVC_GET_VMID, 0, 0, 0))
            .unwrap();
        assert_eq!(x0(&kernel, t), vm.id() as u64);

        kernel
            .handle_guest_exit(0, hvc(HVC_VM_SEND_VIRQ, 7, 45, 0))
            .unwrap();
        assert_eq!(x0(&kernel, t), errno(AxError::NotFound));

        kernel
            .handle_guest_exit(0, hvc(0xc900_0077, 0, 0, 0))
            .unwrap();
        assert_eq!(x0(&kernel, t), errno(AxError::Unsupported));
        assert_irqs_restored(&kernel);
    }

    #[test]
    fn test_passthrough_irq() {
        let kernel = new_kernel(1);
        let (vm, _chip) = boot_vm(&kernel, 1, vec![0]);
        kernel.trap_return(0).unwrap();
        let vcpu = vm.vcpu(0).unwrap().clone();

        kernel.bind_passthrough_irq(0, vm.id(), 0, 72, 40).unwrap();
        assert!(kernel.hal().logged("irq_unmask 72"));
        assert_eq!(
            kernel.bind_passthrough_irq(0, vm.id(), 0, 72, 41),
            Err(AxError::AlreadyExists)
        );
        assert_eq!(
            kernel.send_virq_to_vm(0, vm.id(), 40),
            Err(AxError::PermissionDenied)
        );

        kernel
            .handle_guest_exit(0, GuestExit::Irq { hwirq: 72 })
            .unwrap();
        assert_eq!(kernel.virq_state(&vcpu, 40), Ok(VirqState::Active));
        assert!(kernel.with_virqs(&vcpu, |v| v.desc(40).unwrap().is_hw()));
        assert!(!kernel.pcpu(0).unwrap().in_interrupt());
        assert_eq!(kernel.handle_guest_irq(0, 99), Err(AxError::NotFound));

        kernel.unbind_passthrough_irq(0, 72).unwrap();
        assert!(kernel.hal().logged("irq_mask 72"));
        assert!(!kernel.with_virqs(&vcpu, |v| v.desc(40).unwrap().is_hw()));
        assert_eq!(kernel.unbind_passthrough_irq(0, 72), Err(AxError::NotFound));
    }

    #[test]
    fn test_vm_suspend_latches_virqs() {
        let kernel = new_kernel(1);
        let (vm, chip) = boot_vm(&kernel, 1, vec![0]);
        kernel.trap_return(0).unwrap();
        let vcpu = vm.vcpu(0).unwrap().clone();
        let t = vcpu.task_id().unwrap();

        kernel
            .handle_guest_exit(0, hvc(PSCI_SYSTEM_SUSPEND, 0, 0, 0))
            .unwrap();
        assert_eq!(x0(&kernel, t), 0);
        assert_eq!(vm.state(), VmState::Suspend);
        assert!(kernel.current(0).unwrap().is_idle());
        assert_eq!(kernel.vm_resume(0, 9), Err(AxError::NotFound));

        assert_eq!(
            kernel.send_virq_to_vm(0, vm.id(), 40),
            Err(AxError::WouldBlock)
        );
        assert_eq!(kernel.virq_state(&vcpu, 40), Ok(VirqState::Offline));
        assert_eq!(kernel.task(t).unwrap().state(), TaskState::Suspend);

        kernel.with_virqs(&vcpu, |v| v.set_wakeup(41, true)).unwrap();
        kernel.send_virq_to_vm(0, vm.id(), 41).unwrap();
        assert_eq!(vm.state(), VmState::Online);
        assert_eq!(kernel.with_virqs(&vcpu, |v| v.pending_virqs()), vec![40, 41]);
        assert_eq!(kernel.task(t).unwrap().state(), TaskState::Ready);
        assert_eq!(kernel.vm_resume(0, vm.id()), Err(AxError::BadState));

        kernel.trap_return(0).unwrap();
        kernel.enter_guest(0).unwrap();
        assert_eq!(current_id(&kernel, 0), t);
        assert_eq!(chip.mmio_read(0, EMU_ACK), Ok(40));
        assert_eq!(chip.mmio_read(0, EMU_ACK), Ok(41));
    }

    #[test]
    fn test_vm_reset_reboots_bsp() {
        let kernel = new_kernel(1);
        let (vm, _chip) = boot_vm(&kernel, 1, vec![0]);
        kernel.trap_return(0).unwrap();
        let vcpu = vm.vcpu(0).unwrap().clone();
        let t = vcpu.task_id().unwrap();

        kernel.virq_mask(&vcpu, 40).unwrap();
        kernel.send_virq_to_vm(0, vm.id(), 40).unwrap();
        assert_eq!(kernel.with_virqs(&vcpu, |v| v.pending_virqs()), vec![40]);

        kernel
            .handle_guest_exit(0, hvc(PSCI_SYSTEM_RESET, 0, 0, 0))
            .unwrap();
        assert_eq!(vm.state(), VmState::Online);
        assert_eq!(current_id(&kernel, 0), t);
        assert!(vcpu.is_powered());
        assert!(kernel.with_virqs(&vcpu, |v| v.pending_virqs()).is_empty());
        let task = kernel.task(t).unwrap();
        assert_eq!(task.state(), TaskState::Running);
        assert_eq!(unsafe { task.context_mut() }.pc, vm.entry().as_usize() as u64);
    }

    #[test]
    fn test_vcpu_power_on_and_vm_destroy_across_cores() {
        let kernel = new_kernel(2);
        let (vm, _chip) = boot_vm(&kernel, 2, vec![0, 1]);
        let (t0, t1) = start_second_vcpu(&kernel, &vm);
        assert!(kernel.hal().logged("ipi 1 IrqWork"));
        assert!(kernel.hal().logged("switch 1 pc=0x40100000"));

        kernel
            .handle_guest_exit(0, hvc(PSCI_CPU_ON, 1, 0x4010_0000, 0))
            .unwrap();
        assert_eq!(x0(&kernel, t0), errno(AxError::AlreadyExists));

        // the remote vcpu is stopped by its own core before the vm goes away
        with_core1_responder(&kernel, || kernel.destroy_vm(0, vm.id())).unwrap();
        assert!(kernel.hal().logged("ipi 1 Call"));
        assert!(kernel.vm(vm.id()).is_err());
        assert_eq!(kernel.task(t0).unwrap().state(), TaskState::Stop);
        assert_eq!(kernel.task(t1).unwrap().state(), TaskState::Stop);

        kernel.trap_return(0).unwrap();
        assert!(kernel.current(0).unwrap().is_idle());
        assert!(kernel.current(1).unwrap().is_idle());
        assert_eq!(kernel.release_task(0), Ok(1));
        assert_eq!(kernel.release_task(1), Ok(1));
        assert_eq!(kernel.nr_tasks(), 2);
        assert_irqs_restored(&kernel);
    }

    #[test]
    fn test_vm_destroy_waits_for_remote_vcpu() {
        let config = KernelConfig {
            smp_call_rounds: 4,
            ..KernelConfig::with_cpus(2)
        };
        let kernel = Kernel::new(config, MockHal::new()).unwrap();
        let (vm, _chip) = boot_vm(&kernel, 2, vec![0, 1]);
        let (t0, t1) = start_second_vcpu(&kernel, &vm);

        // core 1 never answers: the vm keeps its slot
        assert_eq!(kernel.destroy_vm(0, vm.id()), Err(AxError::ResourceBusy));
        assert!(kernel.vm(vm.id()).is_ok());
        assert_eq!(vm.state(), VmState::Offline);
        assert_eq!(kernel.task(t0).unwrap().state(), TaskState::Stop);
        assert_eq!(kernel.task(t1).unwrap().state(), TaskState::Running);
        let chip = Arc::new(EmulatedVirqChip::new(1, 4));
        let other = kernel.create_vm(0, VmConfig::new("other", 1, chip)).unwrap();
        assert_ne!(other.id(), vm.id());

        kernel.handle_ipi(1, IpiKind::Call).unwrap();
        kernel.trap_return(1).unwrap();
        assert_eq!(kernel.task(t1).unwrap().state(), TaskState::Stop);
        assert!(kernel.current(1).unwrap().is_idle());

        // stopped vcpus are not asked again
        let ipis = kernel.hal().count_logged("ipi 1 Call");
        kernel.destroy_vm(0, vm.id()).unwrap();
        assert_eq!(kernel.hal().count_logged("ipi 1 Call"), ipis);
        assert!(kernel.vm(vm.id()).is_err());
        assert_irqs_restored(&kernel);
    }

    #[test]
    fn test_vm_reset_waits_for_remote_vcpu() {
        let config = KernelConfig {
            smp_call_rounds: 1 << 20,
            ..KernelConfig::with_cpus(2)
        };
        let kernel = Kernel::new(config, MockHal::new()).unwrap();
        let (vm, _chip) = boot_vm(&kernel, 2, vec![0, 1]);
        let (t0, t1) = start_second_vcpu(&kernel, &vm);

        with_core1_responder(&kernel, || {
            kernel
                .handle_guest_exit(0, hvc(PSCI_SYSTEM_RESET, 0, 0, 0))
                .unwrap()
        });
        assert_eq!(vm.state(), VmState::Online);
        assert_eq!(current_id(&kernel, 0), t0);
        assert!(kernel.current(1).unwrap().is_idle());
        assert_eq!(kernel.task(t1).unwrap().state(), TaskState::Suspend);
        let vcpu1 = vm.vcpu(1).unwrap().clone();
        assert!(!vcpu1.is_powered());

        // nothing of the reset is left behind to clear a virq raised afterwards
        kernel.send_virq_to_vcpu(0, vm.id(), 1, 20).unwrap();
        kernel.handle_ipi(1, IpiKind::Call).unwrap();
        assert_eq!(kernel.virq_state(&vcpu1, 20), Ok(VirqState::Pending));
        assert_eq!(kernel.with_virqs(&vcpu1, |v| v.pending_virqs()), vec![20]);
        assert_irqs_restored(&kernel);
    }

    #[test]
    fn test_vm_suspend_only_from_bsp_with_others_off() {
        let kernel = new_kernel(1);
        let (vm, _chip) = boot_vm(&kernel, 2, vec![0, 0]);
        assert!(kernel.current(0).unwrap().is_idle());
        assert_eq!(
            kernel.vm_suspend(0, vm.id()),
            Err(AxError::PermissionDenied)
        );

        kernel.trap_return(0).unwrap();
        let t0 = vm.vcpu(0).unwrap().task_id().unwrap();
        let t1 = vm.vcpu(1).unwrap().task_id().unwrap();
        assert_eq!(current_id(&kernel, 0), t0);
        kernel
            .handle_guest_exit(0, hvc(PSCI_CPU_ON, 1, 0x4010_0000, 0))
            .unwrap();
        kernel
            .handle_guest_exit(0, hvc(PSCI_SYSTEM_SUSPEND, 0, 0, 0))
            .unwrap();
        assert_eq!(x0(&kernel, t0), errno(AxError::BadState));
        assert_eq!(vm.state(), VmState::Online);

        kernel
            .handle_guest_exit(0, hvc(HVC_SCHED_OUT, 0, 0, 0))
            .unwrap();
        assert_eq!(current_id(&kernel, 0), t1);
        kernel
            .handle_guest_exit(0, hvc(PSCI_SYSTEM_SUSPEND, 0, 0, 0))
            .unwrap();
        assert_eq!(x0(&kernel, t1), errno(AxError::PermissionDenied));
        assert_eq!(vm.state(), VmState::Online);

        kernel
            .handle_guest_exit(0, hvc(PSCI_CPU_OFF, 0, 0, 0))
            .unwrap();
        assert_eq!(current_id(&kernel, 0), t0);
        kernel
            .handle_guest_exit(0, hvc(PSCI_SYSTEM_SUSPEND, 0, 0, 0))
            .unwrap();
        assert_eq!(x0(&kernel, t0), 0);
        assert_eq!(vm.state(), VmState::Suspend);
        assert!(kernel.current(0).unwrap().is_idle());
    }

    #[test]
    fn test_suspend_keeps_acknowledged_virq_in_its_list_register() {
        let kernel = new_kernel(1);
        let lrs = Arc::new(MockLrs::new(1, 4));
        let vgic = Arc::new(Vgic::new(GicVersion::V3, lrs.clone()));
        kernel.register_vmodule(vgic.lr_module());
        let mut config = VmConfig::new("gicv3", 1, vgic);
        config.vcpu_affinity = vec![0];
        let vm = kernel.create_vm(0, config).unwrap();
        kernel.vm_power_on(0, vm.id()).unwrap();
        kernel.trap_return(0).unwrap();
        let vcpu = vm.vcpu(0).unwrap().clone();

        kernel.send_virq_to_vm(0, vm.id(), 40).unwrap();
        kernel.enter_guest(0).unwrap();
        let desc = kernel.with_virqs(&vcpu, |v| v.desc(40).cloned()).unwrap();
        let active = GicVersion::V3.encode_lr(&desc, VirqState::Active);
        lrs.write_lr(0, 0, active);

        kernel
            .handle_guest_exit(0, hvc(PSCI_SYSTEM_SUSPEND, 0, 0, 0))
            .unwrap();
        assert_eq!(vm.state(), VmState::Suspend);
        assert!(kernel.current(0).unwrap().is_idle());
        assert_eq!(lrs.read_lr(0, 0), 0);
        assert_eq!(kernel.with_virqs(&vcpu, |v| v.slots_in_use()), 1);
        assert_eq!(kernel.virq_state(&vcpu, 40), Ok(VirqState::Active));

        assert_eq!(
            kernel.send_virq_to_vm(0, vm.id(), 40),
            Err(AxError::WouldBlock)
        );
        kernel.vm_resume(0, vm.id()).unwrap();
        assert_eq!(kernel.virq_state(&vcpu, 40), Ok(VirqState::ActiveAndPending));

        // a new virq must not take the list register the guest still owns
        kernel.send_virq_to_vm(0, vm.id(), 41).unwrap();
        kernel.trap_return(0).unwrap();
        kernel.enter_guest(0).unwrap();
        assert_eq!(lrs.read_lr(0, 0), active);
        assert_eq!(kernel.with_virqs(&vcpu, |v| v.desc(41).unwrap().id), Some(1));
        assert_eq!(GicVersion::V3.lr_vintid(lrs.read_lr(0, 1)), 41);

        // end of interrupt: the latched assertion is delivered again
        lrs.write_lr(0, 0, 0);
        kernel.handle_guest_exit(0, GuestExit::Nothing).unwrap();
        assert_eq!(kernel.virq_state(&vcpu, 40), Ok(VirqState::Active));
        assert_eq!(GicVersion::V3.lr_vintid(lrs.read_lr(0, 0)), 40);
        assert_eq!(
            GicVersion::V3.lr_state(lrs.read_lr(0, 0)),
            VirqState::Pending
        );
        assert_irqs_restored(&kernel);
    }

    #[test]
    fn test_guest_boundary_hooks_run_with_irqs_disabled() {
        let kernel = new_kernel(1);
        let depths = Arc::new(Mutex::new(Vec::new()));
        for hook in [HookType::EnterToGuest, HookType::ExitFromGuest] {
            let depth = kernel.hal().irq_depth.clone();
            let depths = depths.clone();
            kernel.register_hook(hook, move |_| {
                depths.lock().push(depth.load(Ordering::SeqCst));
                0
            });
        }
        let (vm, _chip) = boot_vm(&kernel, 1, vec![0]);
        kernel.trap_return(0).unwrap();
        kernel.enter_guest(0).unwrap();
        kernel.handle_guest_exit(0, GuestExit::Nothing).unwrap();
        assert_eq!(depths.lock().len(), 3);
        assert!(depths.lock().iter().all(|&d| d > 0));

        let vcpu = vm.vcpu(0).unwrap();
        kernel.virq_mask(vcpu, 40).unwrap();
        kernel.send_virq_to_vm(0, vm.id(), 40).unwrap();
        assert!(!kernel.has_pending_virq(vcpu));
        kernel.virq_unmask(vcpu, 40).unwrap();
        assert!(kernel.has_pending_virq(vcpu));
        kernel.clear_pending_virq(vcpu, 40).unwrap();
        assert_eq!(kernel.virq_state(vcpu, 40), Ok(VirqState::Inactive));
        assert_irqs_restored(&kernel);
    }

    #[test]
    fn test_send_virq_hypercall_rejects_wide_numbers() {
        let kernel = new_kernel(1);
        let (vm, _chip) = boot_vm(&kernel, 1, vec![0]);
        kernel.trap_return(0).unwrap();
        let vcpu = vm.vcpu(0).unwrap().clone();
        let t = vcpu.task_id().unwrap();

        kernel
            .handle_guest_exit(0, hvc(HVC_VM_SEND_VIRQ, vm.id() as u64, 0x1_0000_0028, 0))
            .unwrap();
        assert_eq!(x0(&kernel, t), errno(AxError::InvalidInput));
        assert_eq!(kernel.virq_state(&vcpu, 40), Ok(VirqState::Inactive));
        assert!(!kernel.has_pending_virq(&vcpu));
    }

    #[test]
    fn test_vm_slot_reserved_during_create() {
        let kernel = new_kernel(1);
        let chip: Arc<dyn VirqChip> = Arc::new(EmulatedVirqChip::new(2, 4));
        kernel.hal().fail_stack.store(true, Ordering::SeqCst);
        assert!(matches!(
            kernel.create_vm(0, VmConfig::new("a", 2, chip.clone())),
            Err(AxError::NoMemory)
        ));
        kernel.hal().fail_stack.store(false, Ordering::SeqCst);
        assert_eq!(kernel.vm(0).map(|vm| vm.id()), Err(AxError::NotFound));

        let a = kernel.create_vm(0, VmConfig::new("a", 2, chip.clone())).unwrap();
        let b = kernel.create_vm(0, VmConfig::new("b", 1, chip.clone())).unwrap();
        assert_eq!(a.id(), 0);
        assert_eq!(b.id(), 1);
        kernel.destroy_vm(0, a.id()).unwrap();
        let c = kernel.create_vm(0, VmConfig::new("c", 1, chip)).unwrap();
        assert_eq!(c.id(), 0);
        assert_eq!(kernel.vm(1).unwrap().name(), "b");
    }

    #[test]
    fn test_wait_forever_and_saturating_deadlines() {
        let kernel = new_kernel(1);
        let ev = Event::new();
        let t = spawn(&kernel, 0, "t", 10);
        assert_eq!(run_next(&kernel, 0), t);

        kernel.hal().set_ticks(1);
        kernel
            .event_task_wait(0, t, &ev, WaitKind::Event, WAIT_FOREVER)
            .unwrap();
        kernel.hal().set_ticks(u64::MAX);
        kernel.sched_tick(0).unwrap();
        assert!(ev.has_waiter(t));
        assert_eq!(kernel.task(t).unwrap().state(), TaskState::WaitEvent);
        assert_eq!(kernel.wake(0, &ev), Ok(t));
        kernel.trap_return(0).unwrap();
        assert_eq!(current_id(&kernel, 0), t);
        assert_eq!(kernel.event_pend_down(t), Ok(PendState::Ok));

        // a deadline past the end of time does not wrap into the past
        kernel.hal().set_ticks(10);
        kernel.set_task_sleep(0, t, u64::MAX - 1).unwrap();
        kernel.sched_tick(0).unwrap();
        assert_eq!(kernel.task(t).unwrap().state(), TaskState::WaitEvent);
        assert!(kernel.current(0).unwrap().is_idle());
    }

    #[test]
    fn test_smp_call_acknowledged() {
        let kernel = new_kernel(2);
        let handle = kernel.smp_call(0, 1, SmpCall::StopCore).unwrap();
        assert!(!handle.is_done());
        assert_eq!(handle.wait(3), Err(AxError::ResourceBusy));
        kernel.handle_ipi(1, IpiKind::Call).unwrap();
        assert_eq!(handle.wait(1), Ok(()));
        assert_eq!(kernel.pcpu(1).unwrap().state(), PcpuState::Stopped);

        let local = kernel.smp_call(0, 0, SmpCall::StopCore).unwrap();
        assert!(local.is_done());
        assert!(kernel.smp_call(0, 5, SmpCall::StopCore).is_err());
    }
}
