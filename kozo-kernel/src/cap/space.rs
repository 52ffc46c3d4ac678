//! Capability space storage
//!
//! CNode slot arrays live in physical frames committed from Untyped
//! regions and are reached through the direct physical map; this module
//! keeps the registry translating `CNodeId` to the backing frame, plus
//! the untyped-object table. Together they implement the engine's
//! `CapStore` seam.
//!
//! The space is split into two registries so revocation can walk the
//! slot store while the reclamation hook updates untyped accounting:
//! the engine borrows [`CNodeRegistry`], the [`KernelReclaim`] hook
//! borrows [`UntypedRegistry`], and CNode registry releases are applied
//! after the traversal finishes.
//!
//! Everything sits behind one mutex: capability operations are
//! whole-space transactions, and kernel code is never preempted, so a
//! single lock is both sufficient and deadlock-free.

use kozo_cap::{
    BadgeMinter, CNodeId, CapSlot, CapStore, ObjectMemory, ObjectType, ResourceReclaim, SlotRef,
    UntypedObject, CNODE_SLOTS,
};
use kozo_common::memory::PAGE_SIZE;
use kozo_common::PhysAddr;
use spin::Mutex;

use crate::ipc;
use crate::memory::layout::phys_to_virt;
use crate::memory::{frame, paging};
use crate::sched;
use crate::thread::pool;
use crate::thread::Tid;

/// Maximum number of CNodes in the registry.
pub const MAX_CNODES: usize = 64;

/// Maximum number of Untyped regions in the registry.
pub const MAX_UNTYPEDS: usize = 64;

/// CNode-to-frame registry; the engine's slot store.
pub struct CNodeRegistry {
    phys: [PhysAddr; MAX_CNODES],
}

impl CNodeRegistry {
    const fn new() -> Self {
        Self {
            phys: [PhysAddr::new(0); MAX_CNODES],
        }
    }

    /// Register a CNode backed by `phys` (zeroed slot storage).
    pub fn register(&mut self, phys: PhysAddr) -> Option<CNodeId> {
        for (i, entry) in self.phys.iter_mut().enumerate() {
            if entry.is_null() {
                *entry = phys;
                return Some(CNodeId::new(i as u16));
            }
        }
        None
    }

    /// Drop a CNode from the registry.
    pub fn release(&mut self, id: CNodeId) {
        if let Some(entry) = self.phys.get_mut(id.value() as usize) {
            *entry = PhysAddr::new(0);
        }
    }

    /// Backing frame of a CNode.
    #[must_use]
    pub fn backing(&self, id: CNodeId) -> Option<PhysAddr> {
        self.phys
            .get(id.value() as usize)
            .copied()
            .filter(|p| !p.is_null())
    }

    #[inline]
    fn slot_ptr(&self, r: SlotRef) -> Option<*mut CapSlot> {
        if r.is_null() {
            return None;
        }
        let phys = self.backing(r.cnode())?;
        let index = r.index() as usize;
        if index >= CNODE_SLOTS {
            return None;
        }
        Some(
            // Slot arrays are plain frames behind the direct map.
            unsafe { phys_to_virt(phys).as_mut_ptr::<CapSlot>().add(index) },
        )
    }
}

impl CapStore for CNodeRegistry {
    fn slot(&self, r: SlotRef) -> Option<&CapSlot> {
        // SAFETY: The CNode frame is exclusively owned by the capability
        // space, which the caller holds locked for the borrow's lifetime.
        self.slot_ptr(r).map(|p| unsafe { &*p })
    }

    fn slot_mut(&mut self, r: SlotRef) -> Option<&mut CapSlot> {
        // SAFETY: As above, with &mut self guaranteeing uniqueness.
        self.slot_ptr(r).map(|p| unsafe { &mut *p })
    }

    fn first_occupied(&self, cnode: CNodeId, except: SlotRef) -> Option<SlotRef> {
        self.backing(cnode)?;
        for i in 0..CNODE_SLOTS {
            let r = SlotRef::new(cnode, i as u16);
            if r == except {
                continue;
            }
            if let Some(slot) = self.slot(r) {
                if !slot.is_null() {
                    return Some(r);
                }
            }
        }
        None
    }
}

/// Untyped-region registry.
pub struct UntypedRegistry {
    untypeds: [UntypedObject; MAX_UNTYPEDS],
    live: [bool; MAX_UNTYPEDS],
}

impl UntypedRegistry {
    const fn new() -> Self {
        Self {
            untypeds: [UntypedObject::empty(); MAX_UNTYPEDS],
            live: [false; MAX_UNTYPEDS],
        }
    }

    /// Register an untyped region; returns its table index.
    pub fn register(&mut self, ut: UntypedObject) -> Option<usize> {
        for i in 0..MAX_UNTYPEDS {
            if !self.live[i] {
                self.untypeds[i] = ut;
                self.live[i] = true;
                return Some(i);
            }
        }
        None
    }

    /// Access a live untyped region.
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut UntypedObject> {
        if *self.live.get(idx)? {
            Some(&mut self.untypeds[idx])
        } else {
            None
        }
    }

    /// Drop an untyped region from the registry.
    pub fn release(&mut self, idx: usize) {
        if let Some(live) = self.live.get_mut(idx) {
            *live = false;
        }
    }

    /// Find the untyped region containing a physical address.
    #[must_use]
    pub fn owning(&self, phys: PhysAddr) -> Option<usize> {
        (0..MAX_UNTYPEDS).find(|&i| {
            self.live[i]
                && phys.as_u64() >= self.untypeds[i].base.as_u64()
                && phys.as_u64() < self.untypeds[i].base.as_u64() + self.untypeds[i].size
        })
    }

    /// Credit `bytes` back to the region owning `phys`, or return the
    /// frames to the allocator if no region claims them.
    pub fn credit_or_free(&mut self, phys: PhysAddr, bytes: u64) {
        match self.owning(phys) {
            Some(idx) => {
                if let Some(ut) = self.get_mut(idx) {
                    ut.release(bytes);
                }
            }
            None => {
                let mut off = 0;
                while off < bytes {
                    frame::free_frame(phys.offset(off));
                    off += PAGE_SIZE as u64;
                }
            }
        }
    }

    /// Credit an object-sized allocation whose physical home is not
    /// recorded in the slot (endpoint metadata lives in a fixed table).
    /// The baseline system has a single donation region, so the first
    /// live region is the donor.
    pub fn credit_sized(&mut self, ty: ObjectType) {
        if let Ok(bytes) = kozo_cap::object_size(ty) {
            for i in 0..MAX_UNTYPEDS {
                if self.live[i] {
                    self.untypeds[i].release(bytes);
                    break;
                }
            }
        }
    }
}

/// The kernel capability space.
pub struct CapSpace {
    /// Slot storage registry.
    pub cnodes: CNodeRegistry,
    /// Untyped accounting registry.
    pub untypeds: UntypedRegistry,
    /// Badge generator for every capability created in this space.
    pub minter: BadgeMinter,
}

impl CapSpace {
    const fn new() -> Self {
        Self {
            cnodes: CNodeRegistry::new(),
            untypeds: UntypedRegistry::new(),
            minter: BadgeMinter::new(),
        }
    }
}

static CAPSPACE: Mutex<CapSpace> = Mutex::new(CapSpace::new());

/// Run `f` with the kernel capability space.
pub fn with_space<R>(f: impl FnOnce(&mut CapSpace) -> R) -> R {
    f(&mut CAPSPACE.lock())
}

/// Physical-memory zeroing through the direct map (retype hook).
pub struct PhysZero;

impl ObjectMemory for PhysZero {
    fn zero(&mut self, base: PhysAddr, len: u64) {
        // SAFETY: Retype only zeroes bytes it just committed from an
        // untyped region nothing else references.
        unsafe {
            core::ptr::write_bytes(phys_to_virt(base).as_mut_ptr::<u8>(), 0, len as usize);
        }
    }
}

/// Resource teardown for revoked capabilities.
///
/// Runs inside the engine's children-first traversal. CNode registry
/// entries cannot be released while the engine holds the slot store, so
/// they are queued here and applied by [`finish_reclaim`] afterwards.
pub struct KernelReclaim<'a> {
    untypeds: &'a mut UntypedRegistry,
    dead_cnodes: [Option<CNodeId>; MAX_CNODES],
    n_dead: usize,
}

impl<'a> KernelReclaim<'a> {
    /// Start a reclamation pass.
    pub fn new(untypeds: &'a mut UntypedRegistry) -> Self {
        Self {
            untypeds,
            dead_cnodes: [None; MAX_CNODES],
            n_dead: 0,
        }
    }

    /// CNodes whose registry entries must be released post-traversal.
    pub fn dead_cnodes(&self) -> impl Iterator<Item = CNodeId> + '_ {
        self.dead_cnodes[..self.n_dead].iter().flatten().copied()
    }
}

impl ResourceReclaim for KernelReclaim<'_> {
    fn release(&mut self, _at: SlotRef, slot: &CapSlot) {
        // Minted and copied capabilities share their object with the
        // original; only the original's destruction takes the object
        // down with it.
        if !slot.is_original() {
            return;
        }
        match slot.cap_type() {
            ObjectType::Frame | ObjectType::PageTable => {
                self.untypeds.credit_or_free(slot.phys(), PAGE_SIZE as u64);
            }
            ObjectType::AddressSpace => {
                paging::destroy_address_space(slot.phys());
            }
            ObjectType::Endpoint => {
                ipc::destroy_endpoint(slot.object_index() as u16);
                self.untypeds.credit_sized(ObjectType::Endpoint);
            }
            ObjectType::Thread => {
                let tid = slot.object_index() as Tid;
                ipc::remove_from_endpoint(tid);
                if sched::remove_thread(tid) {
                    pool::free_tcb(tid);
                    self.untypeds.credit_sized(ObjectType::Thread);
                } else {
                    log::warn!("revocation of the running thread {tid} ignored");
                }
            }
            ObjectType::CNode => {
                if self.n_dead < MAX_CNODES {
                    self.dead_cnodes[self.n_dead] = Some(CNodeId::new(slot.data() as u16));
                    self.n_dead += 1;
                }
            }
            ObjectType::Untyped => {
                self.untypeds.release(slot.object_index());
            }
            ObjectType::IrqHandler | ObjectType::Null => {}
        }
    }
}

/// Apply the deferred CNode releases of a finished reclamation pass.
pub fn finish_reclaim(space: &mut CapSpace, dead: &[CNodeId]) {
    for &id in dead {
        if let Some(phys) = space.cnodes.backing(id) {
            space.cnodes.release(id);
            let bytes = (CNODE_SLOTS * core::mem::size_of::<CapSlot>()) as u64;
            space.untypeds.credit_or_free(phys, bytes);
        }
    }
}
