//! The broker's three entry points: frontend MMIO traps, backend
//! hypercalls, and cross-CPU message delivery.
//!
//! Trap context runs on the frontend CPU, hypercall context on the
//! backend CPU, and message handlers on whichever CPU a signal targets.
//! All three meet in the per-instance state, serialised by the instance
//! lock. No lock is held across a host callout (send, inject, idle).

use crate::hal::{HostCpu, MmioAccess, VmId};
use crate::protocol::{CpuMessage, HypercallResult, InstanceId, MessageEvent, VirtioOp};
use crate::queue::Request;
use crate::registry::{Direction, Instance, VirtioBroker};
use log::{error, trace, warn};

// Hypercall argument registers.
const ARG_INSTANCE_ID: u8 = 2;
const ARG_REG_OFFSET: u8 = 3;
const ARG_ADDRESS: u8 = 4;
const ARG_OP: u8 = 5;
const ARG_VALUE: u8 = 6;

impl VirtioBroker {
    /// Frontend trap path: broker a guest MMIO access into the backend's
    /// request table and park the trapping vCPU.
    ///
    /// Returns `false` when no frontend window of the calling VM covers
    /// the address, so the caller can fall back to its generic emulation
    /// path. On `true` the current vCPU has been parked and this CPU has
    /// been through the host's idle primitive; the response is already in
    /// the vCPU register file when execution resumes here.
    pub fn handle_mmio<C: HostCpu>(&self, cpu: &mut C, access: &MmioAccess) -> bool {
        let Some(instance) = self.find_window(cpu.vm_id(), access.addr) else {
            return false;
        };

        let (op, value) = if access.write {
            (VirtioOp::Write, cpu.read_reg(access.reg))
        } else {
            (VirtioOp::Read, 0)
        };
        let request = Request::new(
            op,
            access.addr - instance.window.0,
            access.addr,
            access.width,
            access.reg,
            value,
            instance.priority,
            cpu.cpu_id(),
        );

        let backend_cpu = {
            let mut state = instance.state.lock();
            let state = &mut *state;
            let Some(idx) = state.arena.alloc(request) else {
                error!("virtio {}: request pool exhausted", instance.id);
                return false;
            };
            state.direction = Direction::FrontendToBackend;
            state.backend_pending.insert_by_priority(&mut state.arena, idx);
            state.backend_cpu
        };
        let Some(backend_cpu) = backend_cpu else {
            panic!("virtio {}: transfer before backend CPU assignment", instance.id);
        };

        let event = if instance.polling {
            MessageEvent::NotifyBackendPoll
        } else {
            MessageEvent::InjectInterrupt
        };
        trace!(
            "virtio {}: {:?} off {:#x} queued for backend cpu {}",
            instance.id,
            op,
            access.addr - instance.window.0,
            backend_cpu,
        );
        cpu.send_message(
            backend_cpu,
            CpuMessage {
                event,
                instance_id: instance.id,
            },
        );

        cpu.advance_pc();
        cpu.set_vcpu_active(false);
        cpu.idle();
        true
    }

    /// Backend hypercall path. Arguments arrive in registers x2..x6:
    /// `(instance_id, reg_offset, guest_address, op, value)`. The result
    /// goes back to the caller encoded per [`HypercallResult::encode`].
    pub fn handle_hypercall<C: HostCpu>(&self, cpu: &mut C) -> HypercallResult {
        let instance_id = cpu.read_reg(ARG_INSTANCE_ID);
        let reg_offset = cpu.read_reg(ARG_REG_OFFSET);
        let _address = cpu.read_reg(ARG_ADDRESS);
        let value = cpu.read_reg(ARG_VALUE);

        let Ok(op) = VirtioOp::try_from(cpu.read_reg(ARG_OP)) else {
            return HypercallResult::InvalidArgs;
        };
        match op {
            VirtioOp::Write | VirtioOp::Read => {
                self.complete_request(cpu, instance_id, reg_offset, value, op)
            }
            VirtioOp::Ask => self.fetch_request(cpu, instance_id, reg_offset, value),
            VirtioOp::Notify => self.notify_frontend(cpu, instance_id),
        }
    }

    /// Receive dispatcher for broker messages; the host's IPI glue calls
    /// this for every message tagged [`CpuMessage::CHANNEL`].
    pub fn handle_message<C: HostCpu>(&self, cpu: &mut C, msg: CpuMessage) {
        match msg.event {
            MessageEvent::WriteNotify | MessageEvent::ReadNotify => {
                self.deliver_response(cpu, msg)
            }
            MessageEvent::InjectInterrupt => self.inject_interrupt(cpu, msg.instance_id),
            MessageEvent::NotifyBackendPoll => {
                // Pure wakeup; the polling backend re-enters its ASK loop
                // the next time it is scheduled.
            }
        }
    }

    /// Look up `id` and check the calling VM owns its backend.
    fn caller_backend(&self, vm: VmId, id: InstanceId) -> Option<&Instance> {
        let instance = self.find(id)?;
        if instance.backend_vm != vm {
            warn!(
                "virtio {}: hypercall from vm {}, backend is vm {}",
                id, vm, instance.backend_vm
            );
            return None;
        }
        Some(instance)
    }

    /// `ASK`: hand the next unfetched request to the backend. The reply
    /// travels in the caller's x1..x6.
    fn fetch_request<C: HostCpu>(
        &self,
        cpu: &mut C,
        instance_id: InstanceId,
        reg_offset: u64,
        value: u64,
    ) -> HypercallResult {
        if reg_offset != 0 || value != 0 {
            return HypercallResult::InvalidArgs;
        }
        let Some(instance) = self.caller_backend(cpu.vm_id(), instance_id) else {
            return HypercallResult::Failure;
        };

        let fetched = {
            let mut state = instance.state.lock();
            let state = &mut *state;
            match state.backend_pending.find(&state.arena, |r| !r.handed_off) {
                Some(idx) => {
                    let request = state.arena.get_mut(idx);
                    request.handed_off = true;
                    Some(*request)
                }
                None => None,
            }
        };
        let Some(request) = fetched else {
            return HypercallResult::Failure;
        };

        cpu.write_reg(1, instance_id);
        cpu.write_reg(2, request.reg_offset);
        cpu.write_reg(3, request.guest_address);
        cpu.write_reg(4, request.op as u64);
        cpu.write_reg(5, request.value);
        cpu.write_reg(6, request.access_width as u64);
        HypercallResult::Success
    }

    /// `WRITE`/`READ`: the backend finished servicing the head request.
    /// Move it to the frontend-pending table and signal the CPU that took
    /// the trap.
    fn complete_request<C: HostCpu>(
        &self,
        cpu: &mut C,
        instance_id: InstanceId,
        reg_offset: u64,
        value: u64,
        op: VirtioOp,
    ) -> HypercallResult {
        let Some(instance) = self.caller_backend(cpu.vm_id(), instance_id) else {
            return HypercallResult::Failure;
        };

        let target = {
            let mut state = instance.state.lock();
            let state = &mut *state;
            let Some(idx) = state.backend_pending.pop_front(&mut state.arena) else {
                warn!("virtio {}: completion with no pending request", instance_id);
                return HypercallResult::Failure;
            };
            if state.arena.get(idx).reg_offset != reg_offset {
                // The backend lost sync with the queue; drop the request.
                // The frontend stays parked until the backend recovers.
                let stale = state.arena.free(idx);
                warn!(
                    "virtio {}: completion offset {:#x} does not match head {:#x}",
                    instance_id, reg_offset, stale.reg_offset
                );
                return HypercallResult::Failure;
            }
            let request = state.arena.get_mut(idx);
            request.value = value;
            let target = request.frontend_cpu_at_trap;
            state.frontend_pending.push_back(&mut state.arena, idx);
            state.direction = Direction::BackendToFrontend;
            target
        };

        let event = match op {
            VirtioOp::Read => MessageEvent::ReadNotify,
            _ => MessageEvent::WriteNotify,
        };
        trace!("virtio {}: {:?} completed, waking cpu {}", instance_id, op, target);
        cpu.send_message(
            target,
            CpuMessage {
                event,
                instance_id,
            },
        );
        HypercallResult::Success
    }

    /// `NOTIFY`: raise the frontend's device interrupt without touching
    /// the request tables.
    fn notify_frontend<C: HostCpu>(
        &self,
        cpu: &mut C,
        instance_id: InstanceId,
    ) -> HypercallResult {
        let Some(instance) = self.caller_backend(cpu.vm_id(), instance_id) else {
            return HypercallResult::Failure;
        };

        let frontend_cpu = {
            let mut state = instance.state.lock();
            state.direction = Direction::BackendToFrontend;
            state.frontend_cpu
        };
        let Some(frontend_cpu) = frontend_cpu else {
            panic!("virtio {}: notify before frontend CPU assignment", instance_id);
        };

        cpu.send_message(
            frontend_cpu,
            CpuMessage {
                event: MessageEvent::InjectInterrupt,
                instance_id,
            },
        );
        HypercallResult::Success
    }

    /// A completion landed on the CPU whose vCPU is parked on it: pop the
    /// response, deliver the read value if any, and wake the vCPU.
    fn deliver_response<C: HostCpu>(&self, cpu: &mut C, msg: CpuMessage) {
        let Some(instance) = self.find(msg.instance_id) else {
            panic!("virtio {}: response for unknown instance", msg.instance_id);
        };

        let request = {
            let mut state = instance.state.lock();
            let state = &mut *state;
            let Some(idx) = state.frontend_pending.pop_front(&mut state.arena) else {
                panic!("virtio {}: response with no parked request", msg.instance_id);
            };
            state.arena.free(idx)
        };

        if msg.event == MessageEvent::ReadNotify {
            cpu.write_reg(request.cpu_register, request.value);
        }
        cpu.set_vcpu_active(true);
    }

    /// Assert the interrupt line of whichever side the instance's last
    /// transfer was headed for.
    fn inject_interrupt<C: HostCpu>(&self, cpu: &mut C, instance_id: InstanceId) {
        let Some(instance) = self.find(instance_id) else {
            panic!("virtio {}: interrupt for unknown instance", instance_id);
        };

        let direction = instance.state.lock().direction;
        let irq = match direction {
            Direction::FrontendToBackend => instance.backend_irq,
            Direction::BackendToFrontend => instance.frontend_irq,
        };
        if irq == 0 {
            panic!(
                "virtio {}: no interrupt line bound for {:?} delivery",
                instance_id, direction
            );
        }
        cpu.inject_irq(irq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{VirtioDeviceConfig, VmConfig, VmConfigTable};
    use crate::hal::{CpuId, IrqId};

    const FRONT_VM: VmId = 0;
    const BACK_VM: VmId = 1;
    const FRONT_CPU: CpuId = 0;
    const BACK_CPU: CpuId = 1;
    const WINDOW: u64 = 0xa000_0000;

    const CAPTURE_MAX: usize = 8;

    struct MockCpu {
        cpu: CpuId,
        vm: VmId,
        regs: [u64; 31],
        active: bool,
        idled: u32,
        pc_advanced: u32,
        injected: [Option<IrqId>; CAPTURE_MAX],
        injected_count: usize,
        sent: [Option<(CpuId, CpuMessage)>; CAPTURE_MAX],
        sent_count: usize,
    }

    impl MockCpu {
        fn new(cpu: CpuId, vm: VmId) -> Self {
            Self {
                cpu,
                vm,
                regs: [0; 31],
                active: true,
                idled: 0,
                pc_advanced: 0,
                injected: [None; CAPTURE_MAX],
                injected_count: 0,
                sent: [None; CAPTURE_MAX],
                sent_count: 0,
            }
        }

        fn sent_messages(&self) -> impl Iterator<Item = &(CpuId, CpuMessage)> {
            self.sent[..self.sent_count].iter().flatten()
        }

        fn last_sent(&self) -> (CpuId, CpuMessage) {
            self.sent[self.sent_count - 1].unwrap()
        }
    }

    impl HostCpu for MockCpu {
        fn cpu_id(&self) -> CpuId {
            self.cpu
        }

        fn vm_id(&self) -> VmId {
            self.vm
        }

        fn read_reg(&self, reg: u8) -> u64 {
            self.regs[reg as usize]
        }

        fn write_reg(&mut self, reg: u8, value: u64) {
            self.regs[reg as usize] = value;
        }

        fn inject_irq(&mut self, irq: IrqId) {
            self.injected[self.injected_count] = Some(irq);
            self.injected_count += 1;
        }

        fn set_vcpu_active(&mut self, active: bool) {
            self.active = active;
        }

        fn advance_pc(&mut self) {
            self.pc_advanced += 1;
        }

        fn send_message(&mut self, target: CpuId, msg: CpuMessage) {
            self.sent[self.sent_count] = Some((target, msg));
            self.sent_count += 1;
        }

        fn idle(&mut self) {
            self.idled += 1;
        }
    }

    /// Two VMs: vm 0 hosts the frontends, vm 1 the backends. Instances
    /// are `(id, priority, polling)`, windows 0x200 bytes apart starting
    /// at `WINDOW`; device IRQ 40+i, backend IRQ 50+i.
    fn fixture(instances: &[(InstanceId, u32, bool)]) -> VirtioBroker {
        let mut frontends = VmConfig::new();
        let mut backends = VmConfig::new();
        for (i, &(id, priority, polling)) in instances.iter().enumerate() {
            let base = WINDOW + (i as u64) * 0x1000;
            frontends
                .push(VirtioDeviceConfig::frontend(id, priority, 40 + i as u32, base, 0x200))
                .unwrap();
            backends
                .push(VirtioDeviceConfig::backend(id, 2, 50 + i as u32, polling))
                .unwrap();
        }
        let mut table = VmConfigTable::new();
        table.push_vm(frontends).unwrap();
        table.push_vm(backends).unwrap();

        let broker = VirtioBroker::build(&table).unwrap();
        broker.assign_cpus(FRONT_VM, FRONT_CPU);
        broker.assign_cpus(BACK_VM, BACK_CPU);
        broker
    }

    fn trap(broker: &VirtioBroker, cpu: &mut MockCpu, addr: u64, reg: u8, write: bool) -> bool {
        broker.handle_mmio(
            cpu,
            &MmioAccess {
                addr,
                reg,
                width: 4,
                write,
            },
        )
    }

    fn hypercall(
        broker: &VirtioBroker,
        cpu: &mut MockCpu,
        instance_id: InstanceId,
        reg_offset: u64,
        op: VirtioOp,
        value: u64,
    ) -> HypercallResult {
        cpu.regs[ARG_INSTANCE_ID as usize] = instance_id;
        cpu.regs[ARG_REG_OFFSET as usize] = reg_offset;
        cpu.regs[ARG_ADDRESS as usize] = 0;
        cpu.regs[ARG_OP as usize] = op as u64;
        cpu.regs[ARG_VALUE as usize] = value;
        broker.handle_hypercall(cpu)
    }

    fn pending_counts(broker: &VirtioBroker, id: InstanceId) -> (usize, usize) {
        let instance = broker.find(id).unwrap();
        let state = instance.state.lock();
        (state.backend_pending.len(), state.frontend_pending.len())
    }

    #[test]
    fn write_round_trip() {
        let broker = fixture(&[(7, 1, false)]);
        let mut front = MockCpu::new(FRONT_CPU, FRONT_VM);
        let mut back = MockCpu::new(BACK_CPU, BACK_VM);

        front.regs[3] = 0xdead_beef;
        assert!(trap(&broker, &mut front, WINDOW + 0x10, 3, true));

        // Trap parked the vCPU and signalled the backend CPU.
        assert!(!front.active);
        assert_eq!(front.pc_advanced, 1);
        assert_eq!(front.idled, 1);
        let (target, msg) = front.last_sent();
        assert_eq!(target, BACK_CPU);
        assert_eq!(msg.event, MessageEvent::InjectInterrupt);
        assert_eq!(msg.instance_id, 7);

        // Backend fetches the request: reply in x1..x6.
        assert_eq!(
            hypercall(&broker, &mut back, 7, 0, VirtioOp::Ask, 0),
            HypercallResult::Success
        );
        assert_eq!(back.regs[1], 7);
        assert_eq!(back.regs[2], 0x10);
        assert_eq!(back.regs[3], WINDOW + 0x10);
        assert_eq!(back.regs[4], VirtioOp::Write as u64);
        assert_eq!(back.regs[5], 0xdead_beef);
        assert_eq!(back.regs[6], 4);

        // Backend acknowledges the write.
        assert_eq!(
            hypercall(&broker, &mut back, 7, 0x10, VirtioOp::Write, 0xdead_beef),
            HypercallResult::Success
        );
        let (target, msg) = back.last_sent();
        assert_eq!(target, FRONT_CPU);
        assert_eq!(msg.event, MessageEvent::WriteNotify);

        // The notify wakes the frontend; its register is untouched.
        broker.handle_message(&mut front, msg);
        assert!(front.active);
        assert_eq!(front.regs[3], 0xdead_beef);
        assert_eq!(pending_counts(&broker, 7), (0, 0));
    }

    #[test]
    fn read_round_trip() {
        let broker = fixture(&[(7, 1, false)]);
        let mut front = MockCpu::new(FRONT_CPU, FRONT_VM);
        let mut back = MockCpu::new(BACK_CPU, BACK_VM);

        assert!(trap(&broker, &mut front, WINDOW + 0x70, 5, false));
        assert!(!front.active);

        assert_eq!(
            hypercall(&broker, &mut back, 7, 0, VirtioOp::Ask, 0),
            HypercallResult::Success
        );
        assert_eq!(back.regs[4], VirtioOp::Read as u64);
        assert_eq!(back.regs[5], 0);

        // Backend returns the read value.
        assert_eq!(
            hypercall(&broker, &mut back, 7, 0x70, VirtioOp::Read, 0x1234_5678),
            HypercallResult::Success
        );
        let (target, msg) = back.last_sent();
        assert_eq!(target, FRONT_CPU);
        assert_eq!(msg.event, MessageEvent::ReadNotify);

        broker.handle_message(&mut front, msg);
        assert!(front.active);
        assert_eq!(front.regs[5], 0x1234_5678);
        assert_eq!(pending_counts(&broker, 7), (0, 0));
    }

    #[test]
    fn ask_rejects_malformed_arguments() {
        let broker = fixture(&[(7, 1, false)]);
        let mut back = MockCpu::new(BACK_CPU, BACK_VM);

        assert_eq!(
            hypercall(&broker, &mut back, 7, 0x10, VirtioOp::Ask, 0),
            HypercallResult::InvalidArgs
        );
        assert_eq!(
            hypercall(&broker, &mut back, 7, 0, VirtioOp::Ask, 1),
            HypercallResult::InvalidArgs
        );
    }

    #[test]
    fn ask_on_empty_queue_fails() {
        let broker = fixture(&[(7, 1, false)]);
        let mut back = MockCpu::new(BACK_CPU, BACK_VM);

        assert_eq!(
            hypercall(&broker, &mut back, 7, 0, VirtioOp::Ask, 0),
            HypercallResult::Failure
        );
    }

    #[test]
    fn ask_from_non_backend_vm_fails() {
        let broker = fixture(&[(7, 1, false)]);
        let mut front = MockCpu::new(FRONT_CPU, FRONT_VM);
        let mut intruder = MockCpu::new(3, 2);

        front.regs[3] = 1;
        assert!(trap(&broker, &mut front, WINDOW, 3, true));
        assert_eq!(
            hypercall(&broker, &mut intruder, 7, 0, VirtioOp::Ask, 0),
            HypercallResult::Failure
        );
        // The request is still there for the real backend.
        let mut back = MockCpu::new(BACK_CPU, BACK_VM);
        assert_eq!(
            hypercall(&broker, &mut back, 7, 0, VirtioOp::Ask, 0),
            HypercallResult::Success
        );
    }

    #[test]
    fn unknown_op_is_invalid() {
        let broker = fixture(&[(7, 1, false)]);
        let mut back = MockCpu::new(BACK_CPU, BACK_VM);

        back.regs[ARG_INSTANCE_ID as usize] = 7;
        back.regs[ARG_OP as usize] = 9;
        assert_eq!(broker.handle_hypercall(&mut back), HypercallResult::InvalidArgs);
    }

    #[test]
    fn handed_off_requests_are_skipped_by_later_asks() {
        let broker = fixture(&[(7, 1, false)]);
        let mut front_a = MockCpu::new(FRONT_CPU, FRONT_VM);
        let mut front_b = MockCpu::new(2, FRONT_VM);
        let mut back = MockCpu::new(BACK_CPU, BACK_VM);

        // Two frontend vCPUs of the same VM trap on different registers.
        assert!(trap(&broker, &mut front_a, WINDOW + 0x10, 3, false));
        assert!(trap(&broker, &mut front_b, WINDOW + 0x20, 4, false));

        assert_eq!(
            hypercall(&broker, &mut back, 7, 0, VirtioOp::Ask, 0),
            HypercallResult::Success
        );
        assert_eq!(back.regs[2], 0x10);
        assert_eq!(
            hypercall(&broker, &mut back, 7, 0, VirtioOp::Ask, 0),
            HypercallResult::Success
        );
        assert_eq!(back.regs[2], 0x20);
        // Everything handed off; a third ASK finds nothing.
        assert_eq!(
            hypercall(&broker, &mut back, 7, 0, VirtioOp::Ask, 0),
            HypercallResult::Failure
        );

        // Completions come back in queue order, each routed to the CPU
        // that took its trap.
        assert_eq!(
            hypercall(&broker, &mut back, 7, 0x10, VirtioOp::Read, 0xaa),
            HypercallResult::Success
        );
        assert_eq!(back.last_sent().0, FRONT_CPU);
        broker.handle_message(&mut front_a, back.last_sent().1);
        assert_eq!(front_a.regs[3], 0xaa);

        assert_eq!(
            hypercall(&broker, &mut back, 7, 0x20, VirtioOp::Read, 0xbb),
            HypercallResult::Success
        );
        assert_eq!(back.last_sent().0, 2);
        broker.handle_message(&mut front_b, back.last_sent().1);
        assert_eq!(front_b.regs[4], 0xbb);
    }

    #[test]
    fn desynchronised_completion_discards_the_request() {
        let broker = fixture(&[(7, 1, false)]);
        let mut front = MockCpu::new(FRONT_CPU, FRONT_VM);
        let mut back = MockCpu::new(BACK_CPU, BACK_VM);

        front.regs[3] = 0x42;
        assert!(trap(&broker, &mut front, WINDOW + 0x10, 3, true));
        assert_eq!(
            hypercall(&broker, &mut back, 7, 0, VirtioOp::Ask, 0),
            HypercallResult::Success
        );

        // Completion names the wrong register offset.
        assert_eq!(
            hypercall(&broker, &mut back, 7, 0x14, VirtioOp::Write, 0x42),
            HypercallResult::Failure
        );
        // Request discarded, nothing moved to the frontend table, and the
        // frontend stays parked.
        assert_eq!(pending_counts(&broker, 7), (0, 0));
        assert!(!front.active);
        // No wake message was sent for the dropped request.
        assert_eq!(back.sent_messages().count(), 0);
    }

    #[test]
    fn completion_without_pending_request_fails() {
        let broker = fixture(&[(7, 1, false)]);
        let mut back = MockCpu::new(BACK_CPU, BACK_VM);

        assert_eq!(
            hypercall(&broker, &mut back, 7, 0x10, VirtioOp::Write, 0),
            HypercallResult::Failure
        );
    }

    #[test]
    fn polling_backend_gets_a_wakeup_not_an_interrupt() {
        let broker = fixture(&[(7, 1, true)]);
        let mut front = MockCpu::new(FRONT_CPU, FRONT_VM);
        let mut back = MockCpu::new(BACK_CPU, BACK_VM);

        assert!(trap(&broker, &mut front, WINDOW + 0x50, 6, false));
        let (target, msg) = front.last_sent();
        assert_eq!(target, BACK_CPU);
        assert_eq!(msg.event, MessageEvent::NotifyBackendPoll);

        // The wakeup is a no-op on the backend CPU.
        broker.handle_message(&mut back, msg);
        assert_eq!(back.injected_count, 0);

        // A subsequent ASK still returns the request.
        assert_eq!(
            hypercall(&broker, &mut back, 7, 0, VirtioOp::Ask, 0),
            HypercallResult::Success
        );
        assert_eq!(back.regs[2], 0x50);
    }

    #[test]
    fn notify_raises_the_device_interrupt_without_queueing() {
        let broker = fixture(&[(7, 1, false)]);
        let mut front = MockCpu::new(FRONT_CPU, FRONT_VM);
        let mut back = MockCpu::new(BACK_CPU, BACK_VM);

        assert_eq!(
            hypercall(&broker, &mut back, 7, 0, VirtioOp::Notify, 0),
            HypercallResult::Success
        );
        let (target, msg) = back.last_sent();
        assert_eq!(target, FRONT_CPU);
        assert_eq!(msg.event, MessageEvent::InjectInterrupt);

        // Delivery asserts the frontend's device interrupt (irq 40).
        broker.handle_message(&mut front, msg);
        assert_eq!(front.injected[0], Some(40));
        // No table was touched.
        assert_eq!(pending_counts(&broker, 7), (0, 0));
    }

    #[test]
    fn trap_interrupt_targets_the_backend_line() {
        let broker = fixture(&[(7, 1, false)]);
        let mut front = MockCpu::new(FRONT_CPU, FRONT_VM);
        let mut back = MockCpu::new(BACK_CPU, BACK_VM);

        assert!(trap(&broker, &mut front, WINDOW, 3, false));
        let (_, msg) = front.last_sent();
        assert_eq!(msg.event, MessageEvent::InjectInterrupt);

        // Direction is frontend-to-backend, so the backend line (50) is
        // asserted on the backend CPU.
        broker.handle_message(&mut back, msg);
        assert_eq!(back.injected[0], Some(50));
    }

    #[test]
    fn address_outside_every_window_is_not_handled() {
        let broker = fixture(&[(7, 1, false)]);
        let mut front = MockCpu::new(FRONT_CPU, FRONT_VM);

        assert!(!trap(&broker, &mut front, 0xb000_0000, 3, true));
        assert!(front.active);
        assert_eq!(front.pc_advanced, 0);
        assert_eq!(front.sent_messages().count(), 0);
        assert_eq!(pending_counts(&broker, 7), (0, 0));
    }

    #[test]
    fn instances_dispatch_independently() {
        // Instance 7 at priority 1, instance 9 at priority 5. Traps land
        // on 9 first; each instance's queue is its own, so ASKs against 7
        // and 9 both succeed regardless of arrival order, and the backend
        // CPU saw the signals in arrival order.
        let broker = fixture(&[(7, 1, false), (9, 5, false)]);
        let mut front_a = MockCpu::new(FRONT_CPU, FRONT_VM);
        let mut front_b = MockCpu::new(2, FRONT_VM);
        let mut back = MockCpu::new(BACK_CPU, BACK_VM);

        assert!(trap(&broker, &mut front_b, WINDOW + 0x1000, 4, false)); // instance 9
        assert!(trap(&broker, &mut front_a, WINDOW + 0x10, 3, false)); // instance 7

        assert_eq!(front_b.last_sent().1.instance_id, 9);
        assert_eq!(front_a.last_sent().1.instance_id, 7);

        assert_eq!(
            hypercall(&broker, &mut back, 7, 0, VirtioOp::Ask, 0),
            HypercallResult::Success
        );
        assert_eq!(back.regs[1], 7);
        assert_eq!(
            hypercall(&broker, &mut back, 9, 0, VirtioOp::Ask, 0),
            HypercallResult::Success
        );
        assert_eq!(back.regs[1], 9);
    }

    #[test]
    fn same_priority_requests_are_served_fifo() {
        // Instance priority is fixed at boot, so ordering within an
        // instance reduces to FIFO among equal keys.
        let broker = fixture(&[(7, 3, false)]);
        let mut front_a = MockCpu::new(FRONT_CPU, FRONT_VM);
        let mut front_b = MockCpu::new(2, FRONT_VM);
        let mut back = MockCpu::new(BACK_CPU, BACK_VM);

        assert!(trap(&broker, &mut front_a, WINDOW + 0x30, 3, false));
        assert!(trap(&broker, &mut front_b, WINDOW + 0x40, 4, false));

        assert_eq!(
            hypercall(&broker, &mut back, 7, 0, VirtioOp::Ask, 0),
            HypercallResult::Success
        );
        assert_eq!(back.regs[2], 0x30);
        assert_eq!(
            hypercall(&broker, &mut back, 7, 0, VirtioOp::Ask, 0),
            HypercallResult::Success
        );
        assert_eq!(back.regs[2], 0x40);
    }

    #[test]
    #[should_panic(expected = "no interrupt line bound")]
    fn unbound_interrupt_line_is_fatal() {
        // A frontend entry with device-irq 0 leaves the line unbound.
        let mut frontends = VmConfig::new();
        frontends
            .push(VirtioDeviceConfig::frontend(7, 1, 0, WINDOW, 0x200))
            .unwrap();
        let mut backends = VmConfig::new();
        backends
            .push(VirtioDeviceConfig::backend(7, 2, 50, false))
            .unwrap();
        let mut table = VmConfigTable::new();
        table.push_vm(frontends).unwrap();
        table.push_vm(backends).unwrap();
        let broker = VirtioBroker::build(&table).unwrap();
        broker.assign_cpus(FRONT_VM, FRONT_CPU);
        broker.assign_cpus(BACK_VM, BACK_CPU);

        let mut front = MockCpu::new(FRONT_CPU, FRONT_VM);
        let mut back = MockCpu::new(BACK_CPU, BACK_VM);
        assert_eq!(
            hypercall(&broker, &mut back, 7, 0, VirtioOp::Notify, 0),
            HypercallResult::Success
        );
        broker.handle_message(&mut front, back.last_sent().1);
    }

    #[test]
    #[should_panic(expected = "before backend CPU assignment")]
    fn trap_before_cpu_assignment_is_fatal() {
        let mut frontends = VmConfig::new();
        frontends
            .push(VirtioDeviceConfig::frontend(7, 1, 40, WINDOW, 0x200))
            .unwrap();
        let mut backends = VmConfig::new();
        backends
            .push(VirtioDeviceConfig::backend(7, 2, 50, false))
            .unwrap();
        let mut table = VmConfigTable::new();
        table.push_vm(frontends).unwrap();
        table.push_vm(backends).unwrap();
        // No vCPU has come online yet.
        let broker = VirtioBroker::build(&table).unwrap();

        let mut front = MockCpu::new(FRONT_CPU, FRONT_VM);
        trap(&broker, &mut front, WINDOW, 3, false);
    }
}
