//! Device capability record and GPU family codes.

use serde::{Deserialize, Serialize};

/// Static capabilities of a compute device, captured once at discovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Human-readable name (e.g., "Apple M4 Pro").
    pub name: String,
    /// Stable 64-bit identity of the device across processes.
    pub registry_id: u64,
    pub is_headless: bool,
    pub is_low_power: bool,
    pub is_removable: bool,
    /// Largest single buffer the device will allocate, in bytes.
    pub max_buffer_length: usize,
    /// Widest threadgroup along x.
    pub max_threads_per_threadgroup: usize,
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "GPU Device: {}", self.name)?;
        writeln!(f, "  Registry ID: {:#018x}", self.registry_id)?;
        writeln!(
            f,
            "  Headless: {}  Low power: {}  Removable: {}",
            self.is_headless, self.is_low_power, self.is_removable
        )?;
        writeln!(
            f,
            "  Max buffer length: {} MB",
            self.max_buffer_length / (1024 * 1024)
        )?;
        write!(
            f,
            "  Max threads per threadgroup: {}",
            self.max_threads_per_threadgroup
        )
    }
}

/// GPU feature families, with the raw codes Metal uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum GpuFamily {
    /// Apple A7.
    Apple1 = 1001,
    /// Apple A8.
    Apple2 = 1002,
    /// Apple A9 and A10.
    Apple3 = 1003,
    /// Apple A11.
    Apple4 = 1004,
    /// Apple A12.
    Apple5 = 1005,
    /// Apple A13.
    Apple6 = 1006,
    /// Apple A14 and M1.
    Apple7 = 1007,
    /// Apple A15 and M2.
    Apple8 = 1008,
    Mac1 = 2001,
    Mac2 = 2002,
    Common1 = 3001,
    Common2 = 3002,
    Common3 = 3003,
    Metal3 = 5001,
}

impl GpuFamily {
    pub const ALL: [GpuFamily; 14] = [
        GpuFamily::Apple1,
        GpuFamily::Apple2,
        GpuFamily::Apple3,
        GpuFamily::Apple4,
        GpuFamily::Apple5,
        GpuFamily::Apple6,
        GpuFamily::Apple7,
        GpuFamily::Apple8,
        GpuFamily::Mac1,
        GpuFamily::Mac2,
        GpuFamily::Common1,
        GpuFamily::Common2,
        GpuFamily::Common3,
        GpuFamily::Metal3,
    ];

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.code() == code)
    }
}
