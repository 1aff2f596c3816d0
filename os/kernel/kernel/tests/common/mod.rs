#![allow(dead_code)]

use kernel::Kernel;
use kernel_alloc::FrameAlloc;
use kernel_alloc::PhysMapper;
use kernel_alloc::sim::SimPhys;
use kernel_info::boot::{BootHandoff, MemoryKind, MemoryRegion};
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};
use kernel_sched::sim::SimArch;
use kernel_sched::{Pid, TrapFrame};
use kernel_sync::SyncOnceCell;
use kernel_vmem::sim::SimMmu;
use kernel_vmem::{PageEntryBits, VmaKind, VmaList};

pub type SimKernel = Kernel<'static, SimArch, SimPhys>;

/// User data page of the test process.
pub const DATA: u64 = 0x60_0000;

/// Frame 1 holds the (empty) kernel root; RAM from frame 2 on is usable.
pub fn boot(frames: usize) -> (&'static SimPhys, SimKernel) {
    SimArch::reset();
    let ram = SimPhys::leaked(frames);
    let map: &'static [MemoryRegion] = Box::leak(Box::new([
        MemoryRegion::new(0, 2 * 4096, MemoryKind::KernelAndModules),
        MemoryRegion::usable(2 * 4096, (frames as u64 - 2) * 4096),
    ]));
    SimMmu::set_current_root(PhysicalFrame::from_number(1));
    let cell = Box::leak(Box::new(SyncOnceCell::new()));
    // SAFETY: fresh simulated RAM, kernel root at frame 1.
    let kernel = unsafe { Kernel::new(&BootHandoff::new(map), ram, cell) }.unwrap();
    (ram, kernel)
}

pub fn user_entry() -> TrapFrame {
    TrapFrame {
        rip: 0x40_1000,
        cs: 0x23,
        rflags: 0x202,
        rsp: 0x7fff_f000,
        ss: 0x1b,
        ..TrapFrame::default()
    }
}

/// Starts "init" with one writable data page holding `value`.
pub fn spawn_init(ram: &SimPhys, k: &SimKernel, value: u64) -> Pid {
    let space = k.create_user_space().unwrap();
    let mut frames = k.frames();
    let data = frames.alloc_frame().unwrap();
    ram.zero_frame(data);
    // SAFETY: freshly allocated frame.
    unsafe { *ram.phys_to_mut::<u64>(data.base()) = value };
    space
        .map_page(&mut frames, VirtualAddress::new(DATA), data, PageEntryBits::user_rw())
        .unwrap();

    let mut vmas = VmaList::new();
    vmas.add(
        VirtualAddress::new(DATA),
        VirtualAddress::new(DATA + 4096),
        PageEntryBits::user_rw(),
        VmaKind::Data,
    )
    .unwrap();
    k.scheduler()
        .spawn_user("init", space.root(), vmas, &user_entry())
        .unwrap()
}

/// Physical address behind `va` in the running process.
pub fn current_translation(ram: &'static SimPhys, k: &SimKernel, va: u64) -> Option<PhysicalAddress> {
    let root = k.scheduler().with_current(|p| p.address_space())?;
    kernel_vmem::AddressSpace::<SimPhys, SimArch>::from_root(ram, root).translate(VirtualAddress::new(va))
}

pub fn read_u64(ram: &SimPhys, pa: PhysicalAddress) -> u64 {
    // SAFETY: inside simulated RAM; nothing else holds a reference.
    unsafe { *ram.phys_to_mut::<u64>(pa) }
}

pub fn write_u64(ram: &SimPhys, pa: PhysicalAddress, value: u64) {
    // SAFETY: as above.
    unsafe { *ram.phys_to_mut::<u64>(pa) = value };
}
