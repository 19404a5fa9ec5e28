//! VirtIO instance registry and boot-time binding.
//!
//! The registry is built once from the VM configuration, before any vCPU
//! runs, and is immutable afterwards except for the per-instance mutable
//! state behind each instance's lock (CPU identities, transfer direction,
//! request tables).

use crate::config::{ConfigError, VmConfigTable};
use crate::hal::{CpuId, IrqId, VmId};
use crate::protocol::InstanceId;
use crate::queue::{RequestArena, RequestQueue};
use crate::sync::SpinLock;
use log::{debug, info};

/// Hard cap on simultaneously configured VirtIO instances.
pub const VIRTIO_INSTANCES_MAX: usize = 50;

/// Which way the most recent transfer on an instance is travelling.
/// Consulted only when an `InjectInterrupt` message lands, to pick the
/// interrupt line of the side being signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    FrontendToBackend,
    BackendToFrontend,
}

/// Mutable per-instance state; only ever touched under the instance lock.
pub(crate) struct InstanceState {
    /// CPU currently running the frontend VM's vCPU, once assigned.
    pub frontend_cpu: Option<CpuId>,
    /// CPU currently running the backend VM's vCPU, once assigned.
    pub backend_cpu: Option<CpuId>,
    pub direction: Direction,
    pub arena: RequestArena,
    /// Requests awaiting backend service, ascending priority, FIFO ties.
    pub backend_pending: RequestQueue,
    /// Responses awaiting frontend resume, FIFO.
    pub frontend_pending: RequestQueue,
}

/// One bound frontend/backend pair. Static fields are fixed at boot.
#[derive(Debug)]
pub struct Instance {
    pub id: InstanceId,
    pub frontend_vm: VmId,
    pub backend_vm: VmId,
    /// Raised in the frontend when a response or device notification
    /// lands (the device interrupt).
    pub frontend_irq: IrqId,
    /// Raised in the backend when a request arrives in interrupt mode.
    pub backend_irq: IrqId,
    /// Dispatch key stamped onto every request; higher value = lower
    /// priority.
    pub priority: u32,
    /// Opaque device tag forwarded to the backend.
    pub device_type: u32,
    /// Backend runs in polling mode; signal with a plain wakeup instead
    /// of `backend_irq`.
    pub polling: bool,
    /// Frontend MMIO window: (guest VA base, byte length).
    pub window: (u64, u64),
    pub(crate) state: SpinLock<InstanceState>,
}

impl Instance {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.window.0 && addr < self.window.0 + self.window.1
    }
}

/// Partially-bound instance collected while scanning the configuration.
struct Draft {
    id: InstanceId,
    has_frontend: bool,
    has_backend: bool,
    frontend_vm: VmId,
    backend_vm: VmId,
    frontend_irq: IrqId,
    backend_irq: IrqId,
    priority: u32,
    device_type: u32,
    polling: bool,
    window: (u64, u64),
}

impl Draft {
    fn new(id: InstanceId) -> Self {
        Self {
            id,
            has_frontend: false,
            has_backend: false,
            frontend_vm: 0,
            backend_vm: 0,
            frontend_irq: 0,
            backend_irq: 0,
            priority: 0,
            device_type: 0,
            polling: false,
            window: (0, 0),
        }
    }
}

/// The broker: every bound instance plus the entry points operating on
/// them (`handle_mmio`, `handle_hypercall`, `handle_message`).
#[derive(Debug)]
pub struct VirtioBroker {
    instances: [Option<Instance>; VIRTIO_INSTANCES_MAX],
    count: usize,
}

impl VirtioBroker {
    /// Scan every VM's VirtIO device list and bind instances.
    ///
    /// Each `instance_id` must end up with exactly one frontend and one
    /// backend; any other multiplicity is a configuration error naming
    /// the offending instance.
    pub fn build(config: &VmConfigTable) -> Result<Self, ConfigError> {
        let mut drafts: [Option<Draft>; VIRTIO_INSTANCES_MAX] =
            [const { None }; VIRTIO_INSTANCES_MAX];
        let mut count = 0;

        for (vm_id, vm) in config.vms().enumerate() {
            for dev in vm.devices() {
                let pos = (0..count)
                    .find(|&i| drafts[i].as_ref().is_some_and(|d| d.id == dev.instance_id));
                let idx = match pos {
                    Some(i) => i,
                    None => {
                        if count == VIRTIO_INSTANCES_MAX {
                            return Err(ConfigError::TooManyInstances);
                        }
                        drafts[count] = Some(Draft::new(dev.instance_id));
                        count += 1;
                        count - 1
                    }
                };
                let draft = drafts[idx].as_mut().unwrap();

                if dev.backend {
                    if draft.has_backend {
                        return Err(ConfigError::DuplicateBackend(dev.instance_id));
                    }
                    draft.has_backend = true;
                    draft.backend_vm = vm_id;
                    draft.backend_irq = dev.backend_irq;
                    draft.device_type = dev.device_type;
                    draft.polling = dev.polling;
                } else {
                    if draft.has_frontend {
                        return Err(ConfigError::DuplicateFrontend(dev.instance_id));
                    }
                    draft.has_frontend = true;
                    draft.frontend_vm = vm_id;
                    draft.frontend_irq = dev.device_irq;
                    draft.priority = dev.priority;
                    draft.window = (dev.mmio_base, dev.mmio_size);
                }
            }
        }

        let mut instances: [Option<Instance>; VIRTIO_INSTANCES_MAX] =
            [const { None }; VIRTIO_INSTANCES_MAX];
        for (slot, draft) in instances.iter_mut().zip(drafts.iter_mut().take(count)) {
            let draft = draft.take().unwrap();
            if !draft.has_backend {
                return Err(ConfigError::MissingBackend(draft.id));
            }
            if !draft.has_frontend {
                return Err(ConfigError::MissingFrontend(draft.id));
            }
            debug!(
                "virtio {}: frontend vm {} window {:#x}+{:#x}, backend vm {}{}",
                draft.id,
                draft.frontend_vm,
                draft.window.0,
                draft.window.1,
                draft.backend_vm,
                if draft.polling { " (polling)" } else { "" },
            );
            *slot = Some(Instance {
                id: draft.id,
                frontend_vm: draft.frontend_vm,
                backend_vm: draft.backend_vm,
                frontend_irq: draft.frontend_irq,
                backend_irq: draft.backend_irq,
                priority: draft.priority,
                device_type: draft.device_type,
                polling: draft.polling,
                window: draft.window,
                state: SpinLock::new(InstanceState {
                    frontend_cpu: None,
                    backend_cpu: None,
                    direction: Direction::FrontendToBackend,
                    arena: RequestArena::new(),
                    backend_pending: RequestQueue::new(),
                    frontend_pending: RequestQueue::new(),
                }),
            });
        }

        info!("virtio broker: {} instance(s) bound", count);
        Ok(Self { instances, count })
    }

    /// Record the physical CPU a VM's vCPU has come online on. Called
    /// once per vCPU as it first runs; updates every instance the VM
    /// participates in, on either side.
    pub fn assign_cpus(&self, vm: VmId, cpu: CpuId) {
        for instance in self.iter() {
            if instance.frontend_vm != vm && instance.backend_vm != vm {
                continue;
            }
            let mut state = instance.state.lock();
            if instance.frontend_vm == vm {
                state.frontend_cpu = Some(cpu);
            }
            if instance.backend_vm == vm {
                state.backend_cpu = Some(cpu);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.instances[..self.count].iter().flatten()
    }

    /// Instance bound to `id`, if any.
    pub(crate) fn find(&self, id: InstanceId) -> Option<&Instance> {
        self.iter().find(|instance| instance.id == id)
    }

    /// Instance whose frontend window in `vm` covers `addr`.
    pub(crate) fn find_window(&self, vm: VmId, addr: u64) -> Option<&Instance> {
        self.iter()
            .find(|instance| instance.frontend_vm == vm && instance.contains(addr))
    }
}
