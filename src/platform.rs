// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use axerrno::{ax_err, AxResult};
use memory_addr::{align_down, is_aligned, PhysAddr, VirtAddr};
use spin::Mutex;

/// Host physical address.
pub type HostPhysAddr = PhysAddr;
/// Host virtual address.
pub type HostVirtAddr = VirtAddr;

/// Cache type of a host mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Uncacheable,
    WriteBack,
}

/// Page granularity of a host mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4K,
    Size2M,
    Size1G,
}

impl PageSize {
    /// The size in bytes.
    pub const fn bytes(self) -> usize {
        match self {
            Self::Size4K => 0x1000,
            Self::Size2M => 0x20_0000,
            Self::Size1G => 0x4000_0000,
        }
    }
}

/// The host capabilities the monitor depends on but does not own: the
/// locations of firmware tables, the state left by the loader, and the host
/// memory mapper.
///
/// Addresses equal to 0 mean "not present".
pub trait AxPlatform: Send + Sync {
    /// Host physical address of the ACPI RSDP.
    fn acpi_rsdp_hpa(&self) -> HostPhysAddr;

    /// Host physical address of the ACPI DMAR table.
    fn acpi_dmar_hpa(&self) -> HostPhysAddr;

    /// Whether the hypervisor was loaded after the host OS was already running.
    fn loader_is_late_launch(&self) -> bool;

    /// Host physical address of the wakeup entry point set up by the loader.
    fn loader_wakeup_entry_point_hpa(&self) -> HostPhysAddr;

    /// Maps `size` bytes of host physical memory starting at `hpa`.
    ///
    /// Returns `None` if the range cannot be mapped.
    fn map(
        &self,
        hpa: HostPhysAddr,
        size: usize,
        page_size: PageSize,
        memory_type: MemoryType,
    ) -> Option<HostVirtAddr>;

    /// Removes a mapping previously returned by [`AxPlatform::map`].
    fn unmap(&self, hva: HostVirtAddr, size: usize) -> AxResult;

    /// Translates a mapped host virtual address, or returns 0 if it is not mapped.
    fn translate(&self, hva: HostVirtAddr) -> HostPhysAddr;

    /// [`AxPlatform::acpi_rsdp_hpa`], with absence as `None`.
    fn acpi_rsdp(&self) -> Option<HostPhysAddr> {
        present(self.acpi_rsdp_hpa())
    }

    /// [`AxPlatform::acpi_dmar_hpa`], with absence as `None`.
    fn acpi_dmar(&self) -> Option<HostPhysAddr> {
        present(self.acpi_dmar_hpa())
    }

    /// [`AxPlatform::loader_wakeup_entry_point_hpa`], with absence as `None`.
    fn loader_wakeup_entry_point(&self) -> Option<HostPhysAddr> {
        present(self.loader_wakeup_entry_point_hpa())
    }
}

fn present(addr: HostPhysAddr) -> Option<HostPhysAddr> {
    (addr.as_usize() != 0).then_some(addr)
}

/// Firmware and loader facts handed over to a [`DirectMapPlatform`].
#[derive(Debug, Clone, Copy)]
pub struct PlatformInfo {
    pub acpi_rsdp: HostPhysAddr,
    pub acpi_dmar: HostPhysAddr,
    pub late_launch: bool,
    pub wakeup_entry_point: HostPhysAddr,
}

impl Default for PlatformInfo {
    fn default() -> Self {
        Self {
            acpi_rsdp: HostPhysAddr::from_usize(0),
            acpi_dmar: HostPhysAddr::from_usize(0),
            late_launch: false,
            wakeup_entry_point: HostPhysAddr::from_usize(0),
        }
    }
}

/// Maximum number of live mappings of a [`DirectMapPlatform`].
pub const MAX_DIRECT_MAPPINGS: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Mapping {
    hva: usize,
    hpa: usize,
    size: usize,
    memory_type: MemoryType,
}

impl Mapping {
    fn contains(&self, hva: usize) -> bool {
        hva >= self.hva && hva - self.hva < self.size
    }

    fn overlaps(&self, hva: usize, size: usize) -> bool {
        hva < self.hva + self.size && self.hva < hva + size
    }
}

/// A platform whose host memory is mapped at a fixed offset from physical memory,
/// as in a kernel direct map.
///
/// Mappings are recorded in a fixed-size table, so [`AxPlatform::translate`] only
/// answers for addresses inside a live mapping.
pub struct DirectMapPlatform {
    info: PlatformInfo,
    offset: usize,
    mappings: Mutex<heapless::Vec<Mapping, MAX_DIRECT_MAPPINGS>>,
}

impl DirectMapPlatform {
    /// Creates a platform mapping physical address `pa` at virtual address `pa + offset`.
    pub const fn new(info: PlatformInfo, offset: usize) -> Self {
        Self {
            info,
            offset,
            mappings: Mutex::new(heapless::Vec::new()),
        }
    }

    /// Number of live mappings.
    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().len()
    }

    /// Cache type of the mapping containing `hva`.
    pub fn memory_type(&self, hva: HostVirtAddr) -> Option<MemoryType> {
        let hva = hva.as_usize();
        self.mappings
            .lock()
            .iter()
            .find(|m| m.contains(hva))
            .map(|m| m.memory_type)
    }
}

impl AxPlatform for DirectMapPlatform {
    fn acpi_rsdp_hpa(&self) -> HostPhysAddr {
        self.info.acpi_rsdp
    }

    fn acpi_dmar_hpa(&self) -> HostPhysAddr {
        self.info.acpi_dmar
    }

    fn loader_is_late_launch(&self) -> bool {
        self.info.late_launch
    }

    fn loader_wakeup_entry_point_hpa(&self) -> HostPhysAddr {
        self.info.wakeup_entry_point
    }

    fn map(
        &self,
        hpa: HostPhysAddr,
        size: usize,
        page_size: PageSize,
        memory_type: MemoryType,
    ) -> Option<HostVirtAddr> {
        let page = page_size.bytes();
        let hpa = hpa.as_usize();
        if size == 0 || !is_aligned(hpa, page) {
            warn!("refusing to map {:#x} ({:#x} bytes) with {:?} pages", hpa, size, page_size);
            return None;
        }
        let size = align_down(size.checked_add(page - 1)?, page);
        let hva = hpa.checked_add(self.offset)?;
        hva.checked_add(size)?;

        let mut mappings = self.mappings.lock();
        if mappings.iter().any(|m| m.overlaps(hva, size)) {
            warn!("mapping of {:#x} overlaps a live mapping", hpa);
            return None;
        }
        let mapping = Mapping {
            hva,
            hpa,
            size,
            memory_type,
        };
        if mappings.push(mapping).is_err() {
            warn!("direct map table is full");
            return None;
        }
        trace!("mapped {:#x} -> {:#x} ({:#x} bytes, {:?})", hpa, hva, size, memory_type);
        Some(HostVirtAddr::from_usize(hva))
    }

    fn unmap(&self, hva: HostVirtAddr, size: usize) -> AxResult {
        let hva = hva.as_usize();
        let mut mappings = self.mappings.lock();
        let Some(pos) = mappings.iter().position(|m| m.hva == hva) else {
            return ax_err!(NotFound, "no mapping starts at this address");
        };
        if size > mappings[pos].size {
            return ax_err!(InvalidInput, "unmap size exceeds the mapping");
        }
        mappings.swap_remove(pos);
        Ok(())
    }

    fn translate(&self, hva: HostVirtAddr) -> HostPhysAddr {
        let hva = hva.as_usize();
        let hpa = self
            .mappings
            .lock()
            .iter()
            .find(|m| m.contains(hva))
            .map_or(0, |m| m.hpa + (hva - m.hva));
        HostPhysAddr::from_usize(hpa)
    }
}
