//! Request nodes and the two per-instance pending tables.
//!
//! Requests live in a fixed arena of slots; the tables are index-linked
//! lists threaded through the nodes. Arena and tables sit together inside
//! the owning instance's lock, so a request is reachable from exactly one
//! table at a time and links never race.

use crate::hal::CpuId;
use crate::protocol::VirtioOp;

/// Request slots per instance. In-flight requests are bounded by one per
/// parked frontend vCPU, so this tracks the host's vCPU ceiling.
pub const REQUESTS_PER_INSTANCE: usize = 8;

/// List terminator / "not linked" marker.
const NIL: usize = usize::MAX;

/// One in-flight MMIO request.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    /// Offset of the accessed register within the instance's MMIO window.
    pub reg_offset: u64,
    /// Full guest virtual address of the access, forwarded verbatim to
    /// the backend.
    pub guest_address: u64,
    /// Access width in bytes.
    pub access_width: u8,
    /// Whether the guest was storing or loading.
    pub op: VirtioOp,
    /// Write data on the way in; read result on the way back.
    pub value: u64,
    /// Frontend vCPU register that sources or receives `value`.
    pub cpu_register: u8,
    /// CPU that took the trap. The response is routed here even if the
    /// frontend vCPU migrates while the backend services the request.
    pub frontend_cpu_at_trap: CpuId,
    /// Dispatch key copied from the instance; higher value = lower
    /// priority.
    pub priority: u32,
    /// Set once the backend has fetched this request via `ASK`; later
    /// scans skip it.
    pub handed_off: bool,
    next: usize,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        op: VirtioOp,
        reg_offset: u64,
        guest_address: u64,
        access_width: u8,
        cpu_register: u8,
        value: u64,
        priority: u32,
        frontend_cpu_at_trap: CpuId,
    ) -> Self {
        Self {
            reg_offset,
            guest_address,
            access_width,
            op,
            value,
            cpu_register,
            frontend_cpu_at_trap,
            priority,
            handed_off: false,
            next: NIL,
        }
    }
}

/// Fixed pool of request slots for one instance.
pub struct RequestArena {
    slots: [Option<Request>; REQUESTS_PER_INSTANCE],
}

impl RequestArena {
    pub const fn new() -> Self {
        Self {
            slots: [None; REQUESTS_PER_INSTANCE],
        }
    }

    /// Store `request` in a free slot, returning its index.
    pub fn alloc(&mut self, request: Request) -> Option<usize> {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(request);
                return Some(idx);
            }
        }
        None
    }

    /// Release a slot, returning the request that occupied it.
    pub fn free(&mut self, idx: usize) -> Request {
        self.slots[idx].take().expect("freeing an empty request slot")
    }

    pub fn get(&self, idx: usize) -> &Request {
        self.slots[idx].as_ref().expect("dangling request index")
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Request {
        self.slots[idx].as_mut().expect("dangling request index")
    }

    /// Number of occupied slots.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Index-linked pending table.
///
/// `push_back`/`pop_front` give FIFO order; `insert_by_priority` keeps the
/// list ascending by priority value with FIFO tie-breaking.
pub struct RequestQueue {
    head: usize,
    tail: usize,
    len: usize,
}

impl RequestQueue {
    pub const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Append at the tail (FIFO producer side).
    pub fn push_back(&mut self, arena: &mut RequestArena, idx: usize) {
        arena.get_mut(idx).next = NIL;
        if self.tail == NIL {
            self.head = idx;
        } else {
            arena.get_mut(self.tail).next = idx;
        }
        self.tail = idx;
        self.len += 1;
    }

    /// Stable ascending insert: the new node goes after every queued node
    /// whose priority value is less than or equal to its own.
    pub fn insert_by_priority(&mut self, arena: &mut RequestArena, idx: usize) {
        let priority = arena.get(idx).priority;

        let mut prev = NIL;
        let mut cur = self.head;
        while cur != NIL && arena.get(cur).priority <= priority {
            prev = cur;
            cur = arena.get(cur).next;
        }

        arena.get_mut(idx).next = cur;
        if prev == NIL {
            self.head = idx;
        } else {
            arena.get_mut(prev).next = idx;
        }
        if cur == NIL {
            self.tail = idx;
        }
        self.len += 1;
    }

    /// Unlink and return the head.
    pub fn pop_front(&mut self, arena: &mut RequestArena) -> Option<usize> {
        if self.head == NIL {
            return None;
        }
        let idx = self.head;
        self.head = arena.get(idx).next;
        if self.head == NIL {
            self.tail = NIL;
        }
        arena.get_mut(idx).next = NIL;
        self.len -= 1;
        Some(idx)
    }

    /// First queued request for which `pred` holds, in queue order.
    pub fn find(
        &self,
        arena: &RequestArena,
        mut pred: impl FnMut(&Request) -> bool,
    ) -> Option<usize> {
        let mut cur = self.head;
        while cur != NIL {
            if pred(arena.get(cur)) {
                return Some(cur);
            }
            cur = arena.get(cur).next;
        }
        None
    }
}
