mod common;

use common::boot;
use kernel_info::memory::MMIO_WINDOW_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::VmemError;

#[test]
fn mmio_is_mapped_uncached_in_the_window() {
    let (_, k) = boot(512);
    let regs = PhysicalAddress::new(0xfee0_0020);
    let va = k.map_mmio(regs, 0x10).unwrap();
    assert_eq!(va.as_u64(), MMIO_WINDOW_BASE + 0x20);
    assert_eq!(k.kernel_space().translate(va), Some(regs));
    let entry = k.kernel_space().leaf_entry(va).unwrap();
    assert!(entry.cache_disabled() && !entry.user_access());

    // the next mapping starts on a fresh page
    let next = k.map_mmio(PhysicalAddress::new(0xfec0_0000), 0x1001).unwrap();
    assert_eq!(next.as_u64(), MMIO_WINDOW_BASE + 0x1000);
    assert_eq!(k.map_mmio(regs, 0), Err(VmemError::InvalidSize));
}

#[test]
fn dma_buffers_are_contiguous_and_returned() {
    let (_, k) = boot(512);
    // page tables for the window
    k.map_mmio(PhysicalAddress::new(0xfee0_0000), 4096).unwrap();
    let free = k.frames().free_frames_count();

    let dma = k.alloc_dma(2).unwrap();
    assert_eq!(dma.size, 8192);
    assert_eq!(dma.virt.as_u64(), MMIO_WINDOW_BASE + 0x1000);
    assert_eq!(k.kernel_space().translate(dma.virt + 4096), Some(dma.phys + 4096));
    assert_eq!(k.frames().free_frames_count(), free - 2);

    k.remap_write_combining(dma.virt, dma.size).unwrap();
    let entry = k.kernel_space().leaf_entry(dma.virt).unwrap();
    assert!(entry.large_page() && !entry.cache_disabled());

    k.free_dma(dma);
    assert_eq!(k.frames().free_frames_count(), free);
    assert_eq!(k.kernel_space().translate(dma.virt), None);
    assert_eq!(k.alloc_dma(0), Err(VmemError::InvalidSize));
}

#[test]
fn write_combining_needs_a_mapping() {
    let (_, k) = boot(64);
    let va = VirtualAddress::new(MMIO_WINDOW_BASE);
    assert_eq!(k.remap_write_combining(va, 4096), Err(VmemError::NotMapped(va)));
}
