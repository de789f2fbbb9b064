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

use bitflags::bitflags;

/// VMX basic exit reasons (Intel SDM Vol. 3C, Appendix C) understood by the dispatcher.
pub mod reason {
    pub const EXCEPTION_OR_NMI: u32 = 0;
    pub const EXTERNAL_INTERRUPT: u32 = 1;
    pub const INIT_SIGNAL: u32 = 3;
    pub const SIPI: u32 = 4;
    pub const INTERRUPT_WINDOW: u32 = 7;
    pub const NMI_WINDOW: u32 = 8;
    pub const CPUID: u32 = 10;
    pub const HLT: u32 = 12;
    pub const VMCALL: u32 = 18;
    pub const CR_ACCESS: u32 = 28;
    pub const IO_INSTRUCTION: u32 = 30;
    pub const RDMSR: u32 = 31;
    pub const WRMSR: u32 = 32;
    pub const MONITOR_TRAP_FLAG: u32 = 37;
    pub const PREEMPTION_TIMER: u32 = 52;
    pub const XSETBV: u32 = 55;
}

/// A category of vmexits that handlers can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExitCategory {
    InitSignal = 0,
    SipiSignal,
    Nmi,
    NmiWindow,
    ExternalInterrupt,
    InterruptWindow,
    MonitorTrap,
    PreemptionTimer,
    Cpuid,
    Cr0Write,
    Cr3Read,
    Cr3Write,
    Cr4Write,
    Xcr0Write,
    IoPort,
    Rdmsr,
    Wrmsr,
    Vmcall,
}

impl ExitCategory {
    /// Number of exit categories.
    pub const COUNT: usize = 18;

    /// All exit categories, in discriminant order.
    pub const ALL: [ExitCategory; Self::COUNT] = [
        Self::InitSignal,
        Self::SipiSignal,
        Self::Nmi,
        Self::NmiWindow,
        Self::ExternalInterrupt,
        Self::InterruptWindow,
        Self::MonitorTrap,
        Self::PreemptionTimer,
        Self::Cpuid,
        Self::Cr0Write,
        Self::Cr3Read,
        Self::Cr3Write,
        Self::Cr4Write,
        Self::Xcr0Write,
        Self::IoPort,
        Self::Rdmsr,
        Self::Wrmsr,
        Self::Vmcall,
    ];

    /// Index of this category in per-category tables.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The single-bit set containing this category.
    pub const fn flag(self) -> ExitCategorySet {
        ExitCategorySet::from_bits_retain(1 << self as u32)
    }

    /// Whether the hardware always traps this category, so that it cannot be
    /// enabled or disabled.
    pub const fn is_unconditional(self) -> bool {
        matches!(
            self,
            Self::InitSignal | Self::SipiSignal | Self::Cpuid | Self::Xcr0Write | Self::Vmcall
        )
    }

    /// Resolves a vmexit to its category.
    ///
    /// Returns `None` for exit reasons without a category; those are only seen
    /// by the catch-all handler.
    pub fn resolve(exit: &ExitInfo) -> Option<Self> {
        let category = match exit.reason {
            reason::EXCEPTION_OR_NMI if exit.is_nmi() => Self::Nmi,
            reason::EXTERNAL_INTERRUPT => Self::ExternalInterrupt,
            reason::INIT_SIGNAL => Self::InitSignal,
            reason::SIPI => Self::SipiSignal,
            reason::INTERRUPT_WINDOW => Self::InterruptWindow,
            reason::NMI_WINDOW => Self::NmiWindow,
            reason::CPUID => Self::Cpuid,
            reason::VMCALL => Self::Vmcall,
            reason::CR_ACCESS => return Self::resolve_cr_access(exit.qualification),
            reason::IO_INSTRUCTION => Self::IoPort,
            reason::RDMSR => Self::Rdmsr,
            reason::WRMSR => Self::Wrmsr,
            reason::MONITOR_TRAP_FLAG => Self::MonitorTrap,
            reason::PREEMPTION_TIMER => Self::PreemptionTimer,
            reason::XSETBV => Self::Xcr0Write,
            _ => return None,
        };
        Some(category)
    }

    /// Control-register accesses carry the register number in bits 3:0 and the
    /// access type in bits 5:4 of the qualification (0: MOV to CR, 1: MOV from CR).
    fn resolve_cr_access(qualification: u64) -> Option<Self> {
        let cr = qualification & 0xf;
        let access_type = (qualification >> 4) & 0x3;
        match (cr, access_type) {
            (0, 0) => Some(Self::Cr0Write),
            (3, 0) => Some(Self::Cr3Write),
            (3, 1) => Some(Self::Cr3Read),
            (4, 0) => Some(Self::Cr4Write),
            _ => None,
        }
    }
}

bitflags! {
    /// A set of exit categories, used for the enabled and supported exits of a vcpu.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExitCategorySet: u32 {
        const INIT_SIGNAL = 1 << 0;
        const SIPI_SIGNAL = 1 << 1;
        const NMI = 1 << 2;
        const NMI_WINDOW = 1 << 3;
        const EXTERNAL_INTERRUPT = 1 << 4;
        const INTERRUPT_WINDOW = 1 << 5;
        const MONITOR_TRAP = 1 << 6;
        const PREEMPTION_TIMER = 1 << 7;
        const CPUID = 1 << 8;
        const CR0_WRITE = 1 << 9;
        const CR3_READ = 1 << 10;
        const CR3_WRITE = 1 << 11;
        const CR4_WRITE = 1 << 12;
        const XCR0_WRITE = 1 << 13;
        const IO_PORT = 1 << 14;
        const RDMSR = 1 << 15;
        const WRMSR = 1 << 16;
        const VMCALL = 1 << 17;

        /// Categories the hardware traps regardless of the execution controls.
        const UNCONDITIONAL = Self::INIT_SIGNAL.bits()
            | Self::SIPI_SIGNAL.bits()
            | Self::CPUID.bits()
            | Self::XCR0_WRITE.bits()
            | Self::VMCALL.bits();
    }
}

impl ExitCategorySet {
    /// Whether `category` is in the set.
    pub const fn has(&self, category: ExitCategory) -> bool {
        self.contains(category.flag())
    }

    /// Iterates over the categories in the set.
    pub fn categories(self) -> impl Iterator<Item = ExitCategory> {
        ExitCategory::ALL
            .into_iter()
            .filter(move |category| self.has(*category))
    }
}

/// Category-specific data decoded by the backend when the exit happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitDetail {
    /// Nothing beyond the reason and qualification.
    #[default]
    None,
    /// CPUID with the requested leaf (`eax`) and subleaf (`ecx`).
    Cpuid { leaf: u32, subleaf: u32 },
    /// MOV to a control register, or to XCR0 via XSETBV, with the value the
    /// guest attempted to write.
    RegisterWrite { value: u64 },
    /// Port I/O.
    Io {
        port: u16,
        /// Access size in bytes (1, 2 or 4).
        size: u8,
        is_write: bool,
        /// Value written by the guest. Meaningless for reads.
        value: u64,
    },
    /// RDMSR with the MSR address (`ecx`).
    MsrRead { address: u32 },
    /// WRMSR with the MSR address (`ecx`) and value (`edx:eax`).
    MsrWrite { address: u32, value: u64 },
    /// External interrupt with its vector.
    Interrupt { vector: u8 },
    /// SIPI with its startup vector.
    Sipi { vector: u8 },
}

/// A vmexit as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    /// The basic exit reason.
    pub reason: u32,
    /// The exit qualification.
    pub qualification: u64,
    /// The length of the instruction that caused the exit, 0 if none.
    pub instruction_len: u32,
    /// The VM-exit interruption information.
    pub interruption_info: u32,
    pub detail: ExitDetail,
}

impl ExitInfo {
    /// Creates an exit with the given reason and qualification.
    pub const fn new(reason: u32, qualification: u64) -> Self {
        Self {
            reason,
            qualification,
            instruction_len: 0,
            interruption_info: 0,
            detail: ExitDetail::None,
        }
    }

    /// Sets the length of the exiting instruction.
    pub const fn with_instruction_len(mut self, len: u32) -> Self {
        self.instruction_len = len;
        self
    }

    /// Sets the VM-exit interruption information.
    pub const fn with_interruption_info(mut self, info: u32) -> Self {
        self.interruption_info = info;
        self
    }

    /// Sets the decoded category-specific data.
    pub const fn with_detail(mut self, detail: ExitDetail) -> Self {
        self.detail = detail;
        self
    }

    /// Whether the interruption information reports a valid NMI (type 2).
    pub const fn is_nmi(&self) -> bool {
        let valid = self.interruption_info & (1 << 31) != 0;
        let kind = (self.interruption_info >> 8) & 0x7;
        valid && kind == 2
    }
}

/// How the handler of the current vmexit completed the exiting instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitResolution {
    /// Neither executed nor emulated yet.
    #[default]
    Pending,
    /// The real instruction was executed.
    Executed,
    /// The instruction was emulated with the given value.
    Emulated(u64),
}
