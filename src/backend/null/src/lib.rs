//! A software implementation of the native GPU contract.
//!
//! Buffers live in host memory, queues execute command lists synchronously,
//! and pipelines are interpreted [`shader::ShaderBlob`]s. The backend keeps
//! real fence values, budget accounting, and descriptor indirection so the
//! layers above exercise the same paths they would against hardware.

pub mod command;
pub mod device;
pub mod shader;

pub use crate::command::{CommandAllocatorState, CommandList, Queue};
pub use crate::device::{
    CommandAllocator, Device, DescriptorHeap, Fence, Memory, PipelineState, QueryHeap,
};

use rocl_hal as hal;
use rocl_hal::{AdapterInfo, DeviceError, Features, Limits, MemoryBudget};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// The null backend type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Backend {}

impl hal::Backend for Backend {
    type Instance = Instance;
    type Adapter = Adapter;
    type Device = Device;
    type Queue = Queue;
    type Fence = Fence;
    type CommandList = CommandList;
    type CommandAllocator = CommandAllocator;
    type Memory = Memory;
    type DescriptorHeap = DescriptorHeap;
    type PipelineState = PipelineState;
    type QueryHeap = QueryHeap;
}

/// Description of one simulated adapter.
#[derive(Clone, Debug)]
pub struct AdapterOptions {
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub luid: u64,
    pub software: bool,
    pub limits: Limits,
    pub features: Features,
    /// Budget the simulated OS grants the process.
    pub budget: u64,
    pub global_memory: u64,
    pub wave_sizes: (u32, u32),
}

impl Default for AdapterOptions {
    fn default() -> Self {
        AdapterOptions {
            name: "Null Device".to_string(),
            vendor_id: 0x1af4,
            device_id: 0x0001,
            luid: 0x4e55_4c4c,
            software: false,
            limits: Limits::default(),
            features: Features {
                int16_native: true,
                typed_uav_load: true,
                images: true,
                uma: true,
                shader_model: 60,
            },
            budget: 1 << 30,
            global_memory: 4 << 30,
            wave_sizes: (4, 64),
        }
    }
}

impl AdapterOptions {
    /// The software-rasterizer flavor of the default adapter.
    pub fn software() -> Self {
        AdapterOptions {
            name: "Null Software Rasterizer".to_string(),
            device_id: 0x8c,
            vendor_id: 0x1414,
            luid: 0x5741_5250,
            software: true,
            ..AdapterOptions::default()
        }
    }
}

/// Entry point; enumerates whatever adapters it was built with.
#[derive(Debug)]
pub struct Instance {
    adapters: Vec<AdapterOptions>,
}

impl Instance {
    pub fn new(adapters: Vec<AdapterOptions>) -> Self {
        Instance { adapters }
    }
}

impl Default for Instance {
    /// One hardware-flavored adapter plus the software rasterizer, the
    /// shape a real system enumeration produces.
    fn default() -> Self {
        Instance {
            adapters: vec![AdapterOptions::default(), AdapterOptions::software()],
        }
    }
}

impl hal::Instance<Backend> for Instance {
    fn enumerate_adapters(&self) -> Vec<Adapter> {
        self.adapters
            .iter()
            .map(|options| Adapter {
                options: options.clone(),
                usage: Arc::new(AtomicU64::new(0)),
            })
            .collect()
    }
}

/// One simulated GPU.
#[derive(Debug)]
pub struct Adapter {
    options: AdapterOptions,
    // Bytes of resident memory across every device opened from this
    // adapter.
    usage: Arc<AtomicU64>,
}

impl hal::Adapter<Backend> for Adapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: self.options.name.clone(),
            vendor_id: self.options.vendor_id,
            device_id: self.options.device_id,
            luid: self.options.luid,
            software: self.options.software,
        }
    }

    fn features(&self) -> Features {
        self.options.features
    }

    fn limits(&self) -> Limits {
        self.options.limits
    }

    fn memory_budget(&self) -> MemoryBudget {
        MemoryBudget {
            budget: self.options.budget,
            usage: self.usage.load(Ordering::Relaxed),
        }
    }

    fn global_memory_size(&self) -> u64 {
        self.options.global_memory
    }

    fn wave_sizes(&self) -> (u32, u32) {
        self.options.wave_sizes
    }

    fn timestamp_frequency(&self) -> u64 {
        // Timestamps are host nanoseconds.
        1_000_000_000
    }

    fn open(&self) -> Result<hal::Gpu<Backend>, DeviceError> {
        let epoch = Instant::now();
        Ok(hal::Gpu {
            device: Device::new(Arc::clone(&self.usage)),
            queue: Queue::new(epoch),
        })
    }
}
