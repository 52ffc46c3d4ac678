//! Kernel entry point
//!
//! The bootloader drops us here with paging live, the kernel in the
//! higher half, and the physical address of the handover record in the
//! first argument register. Bring-up order matters: descriptor tables
//! before anything can fault, memory before capabilities, capabilities
//! before the first service.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    use kozo_cap::{ops, CapRights, ObjectType, SlotRef};
    use kozo_common::{BootInfo, PhysAddr};

    use kozo_kernel::arch;
    use kozo_kernel::cap::{bootstrap, with_space};
    use kozo_kernel::initrd;
    use kozo_kernel::logging;
    use kozo_kernel::memory::{self, layout, paging};
    use kozo_kernel::sched;
    use kozo_kernel::thread::{pool, setup_thread};

    /// Name of the first service in the archive.
    const INIT_SERVICE: &str = "init";

    /// Kernel entry. `boot_info_phys` arrives in `rdi`.
    #[no_mangle]
    pub extern "C" fn _start(boot_info_phys: u64) -> ! {
        logging::init();
        log::info!("KOZO kernel starting, handover at {boot_info_phys:#x}");

        arch::gdt::init();
        arch::idt::init();

        // SAFETY: The bootloader passes a live handover record reachable
        // through the direct map it set up.
        let boot_info: &BootInfo = unsafe {
            &*layout::phys_to_virt(PhysAddr::new(boot_info_phys)).as_ptr::<BootInfo>()
        };
        assert!(boot_info.is_valid(), "malformed handover record");
        assert!(boot_info.has_initrd(), "no service archive; nothing to run");

        // SAFETY: Called once, direct map active, handover validated.
        unsafe {
            memory::init(boot_info);
        }

        arch::lapic::init();
        // SAFETY: GDT is loaded; no thread has reached user mode yet.
        unsafe {
            arch::syscall_entry::init();
        }

        pool::init();
        let boot_caps = bootstrap::init();

        // The boot context itself becomes the idle thread.
        let idle = pool::alloc_tcb().expect("TCB pool empty at boot");
        sched::init(idle);

        spawn_init(boot_info, &boot_caps);

        log::info!("entering the scheduler");
        sched::yield_now();
        sched::idle::idle_loop()
    }

    /// Build the first service: address space, image, stack, TCB, and
    /// its boot capabilities.
    fn spawn_init(boot_info: &BootInfo, boot_caps: &bootstrap::BootCaps) {
        // SAFETY: The archive range was reserved from the allocator at
        // memory init and is reachable through the direct map.
        let archive = unsafe {
            core::slice::from_raw_parts(
                layout::phys_to_virt(PhysAddr::new(boot_info.initrd_addr)).as_ptr::<u8>(),
                boot_info.initrd_size as usize,
            )
        };

        let aspace = paging::create_address_space().expect("out of frames for init");
        let service = initrd::load_service(archive, INIT_SERVICE, aspace)
            .expect("loading the init service");

        let tid = pool::alloc_tcb().expect("TCB pool empty at boot");
        pool::with_tcb(tid, |tcb| {
            tcb.address_space = aspace;
            tcb.cap_root = boot_caps.root_cnode;
            tcb.set_name(INIT_SERVICE.as_bytes());
            setup_thread(tcb, service.entry, service.stack_top, true);
        });

        with_space(|space| {
            let root = boot_caps.root_cnode;
            let aspace_slot = SlotRef::new(root, bootstrap::INIT_ASPACE_SLOT);

            ops::install_root(
                &mut space.cnodes,
                aspace_slot,
                ObjectType::AddressSpace,
                CapRights::ALL,
                aspace.as_u64(),
                &mut space.minter,
            )
            .expect("seeding init's address-space capability");

            ops::install_child(
                &mut space.cnodes,
                aspace_slot,
                SlotRef::new(root, bootstrap::INIT_THREAD_SLOT),
                ObjectType::Thread,
                CapRights::ALL,
                tid as u64,
                &mut space.minter,
            )
            .expect("seeding init's thread capability");
        });

        sched::unblock(tid);
        log::info!(
            "init service ready: tid {}, entry {}, stack {}",
            tid,
            service.entry,
            service.stack_top
        );
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
