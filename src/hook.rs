use alloc::boxed::Box;
use alloc::vec::Vec;

use spin::RwLock;

use crate::percpu::CoreId;
use crate::task::Task;
use crate::vcpu::Vcpu;
use crate::vm::Vm;

/// Points in the kernel where callbacks run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookType {
    /// A vCPU trapped out of the guest.
    ExitFromGuest,
    /// A vCPU is about to resume the guest.
    EnterToGuest,
    CreateVm,
    DestroyVm,
    SuspendVm,
    ResumeVm,
    CreateTask,
    /// A task is being switched out of its core.
    TaskSwitchOut,
    /// A task is being switched in on its core.
    TaskSwitchTo,
}

impl HookType {
    const COUNT: usize = 9;

    fn index(self) -> usize {
        self as usize
    }
}

/// The object a hook is run for.
pub enum HookItem<'a> {
    Task { core: CoreId, task: &'a Task },
    Vcpu { core: CoreId, vcpu: &'a Vcpu },
    Vm { core: CoreId, vm: &'a Vm },
}

type HookFn = Box<dyn Fn(&HookItem) -> i32 + Send + Sync>;

/// Append-only callback lists, one per [`HookType`], run in registration order.
pub(crate) struct HookRegistry {
    hooks: RwLock<Vec<Vec<HookFn>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new((0..HookType::COUNT).map(|_| Vec::new()).collect()),
        }
    }

    pub fn register<F>(&self, hook: HookType, f: F)
    where
        F: Fn(&HookItem) -> i32 + Send + Sync + 'static,
    {
        self.hooks.write()[hook.index()].push(Box::new(f));
    }

    /// Run the callbacks of `hook`, summing their return codes.
    pub fn run(&self, item: &HookItem, hook: HookType) -> i32 {
        self.hooks.read()[hook.index()]
            .iter()
            .map(|f| f(item))
            .sum()
    }

    pub fn len(&self, hook: HookType) -> usize {
        self.hooks.read()[hook.index()].len()
    }
}
