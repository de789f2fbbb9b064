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

use core::fmt;

use axerrno::AxError;

use crate::exit::ExitCategory;

/// Errors returned by the monitor, the pools and the vCPU execution control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// No free slot is left in the VM or vCPU pool, or the VM has already
    /// created every vCPU it reserved.
    PoolExhausted,
    /// The vCPU is loaded on another physical CPU, or the current physical CPU
    /// already has a different vCPU loaded.
    BindConflict,
    /// The vCPU is not loaded on the current physical CPU.
    NotLoaded,
    /// The hardware rejected the VM entry.
    EntryFailure {
        /// Hardware-reported failure qualification.
        qualification: u64,
    },
    /// The VM id is stale or unknown.
    InvalidVm,
    /// The vCPU id is stale or unknown.
    InvalidVcpu,
    /// The requested number of vCPUs is zero or above the per-VM limit.
    InvalidVcpuCount,
    /// An exit category is enabled but nothing would handle it.
    MissingHandler(ExitCategory),
    /// The embedder's initialization function failed.
    BringUpFailed(AxError),
    /// The architecture backend reported an error.
    Arch(AxError),
}

/// A specialized [`Result`] type for [`VmmError`].
pub type VmmResult<T = ()> = Result<T, VmmError>;

impl fmt::Display for VmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolExhausted => f.write_str("no free slot left in the pool"),
            Self::BindConflict => f.write_str("vcpu or physical cpu is already bound"),
            Self::NotLoaded => f.write_str("vcpu is not loaded on this physical cpu"),
            Self::EntryFailure { qualification } => {
                write!(f, "vm entry failed (qualification {:#x})", qualification)
            }
            Self::InvalidVm => f.write_str("invalid vm id"),
            Self::InvalidVcpu => f.write_str("invalid vcpu id"),
            Self::InvalidVcpuCount => f.write_str("invalid number of vcpus"),
            Self::MissingHandler(category) => {
                write!(f, "vmexit {:?} is enabled but has no handler", category)
            }
            Self::BringUpFailed(err) => write!(f, "bring-up failed: {:?}", err),
            Self::Arch(err) => write!(f, "architecture error: {:?}", err),
        }
    }
}

impl From<AxError> for VmmError {
    fn from(err: AxError) -> Self {
        Self::Arch(err)
    }
}

impl From<VmmError> for AxError {
    fn from(err: VmmError) -> Self {
        match err {
            VmmError::PoolExhausted => AxError::NoMemory,
            VmmError::BindConflict => AxError::ResourceBusy,
            VmmError::NotLoaded | VmmError::EntryFailure { .. } => AxError::BadState,
            VmmError::InvalidVm | VmmError::InvalidVcpu => AxError::NotFound,
            VmmError::InvalidVcpuCount => AxError::InvalidInput,
            VmmError::MissingHandler(_) => AxError::Unsupported,
            VmmError::BringUpFailed(err) | VmmError::Arch(err) => err,
        }
    }
}
