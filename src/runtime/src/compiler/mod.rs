//! Contract with the external kernel compiler and bytecode validator.
//!
//! The real compiler is a dynamically loaded library translating OpenCL C
//! and SPIR-V into native GPU bytecode plus binding metadata; see
//! [`loaded`] for the C-ABI binding. The runtime only depends on these
//! traits, which is also the seam the test suite's interpreter-targeting
//! compiler plugs into.

#[cfg(feature = "loaded-compiler")]
pub mod loaded;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Accumulates a per-device build log.
#[derive(Default)]
pub struct BuildLog {
    text: Mutex<String>,
}

impl BuildLog {
    pub fn new() -> Self {
        BuildLog::default()
    }

    pub fn log(&self, message: &str) {
        let mut text = self.text.lock();
        text.push_str(message);
        if !message.ends_with('\n') {
            text.push('\n');
        }
    }

    pub fn take(&self) -> String {
        std::mem::take(&mut self.text.lock())
    }
}

impl fmt::Debug for BuildLog {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BuildLog").finish()
    }
}

/// Address space of a kernel argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpace {
    Private,
    Constant,
    Local,
    Global,
}

/// Source-level description of one kernel argument.
#[derive(Clone, Debug)]
pub struct ArgInfo {
    pub name: String,
    pub type_name: String,
    pub address_space: AddressSpace,
    pub readable: bool,
    pub writable: bool,
    pub is_const: bool,
}

/// Source-level description of one kernel in a program.
#[derive(Clone, Debug)]
pub struct KernelInfo {
    pub name: String,
    pub args: Vec<ArgInfo>,
}

/// Size of a declared specialization constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpecConstantInfo {
    pub value_size: u32,
}

/// Values for specialization constants, at most eight bytes each.
pub type SpecConstantValues = HashMap<u32, [u8; 8]>;

/// A parsed intermediate program (SPIR-V-shaped): the serialized bytes plus
/// the kernel and spec-constant metadata extracted from them.
pub trait ProgramIl: Send + Sync {
    fn bytes(&self) -> &[u8];
    fn kernels(&self) -> &[KernelInfo];
    fn spec_constant(&self, id: u32) -> Option<SpecConstantInfo>;
}

/// Compiler feature switches implied by device capabilities.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompileFeatures {
    pub fp16: bool,
    pub fp64: bool,
    pub int64: bool,
    pub images: bool,
    pub images_read_write: bool,
    pub images_write_3d: bool,
}

/// Inputs to a source compile.
pub struct CompileArgs<'a> {
    pub source: &'a str,
    /// `(name, contents)` of embedded headers.
    pub headers: Vec<(String, String)>,
    pub features: CompileFeatures,
    /// Preprocessor and warning arguments, already parsed from the API
    /// options string.
    pub cmdline: Vec<String>,
}

/// How an argument is delivered to a compiled kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArgBinding {
    /// By-value bytes copied into the inputs constant buffer.
    None,
    /// Global/constant memory bound through the UAV table.
    Memory { buffer_id: u32 },
    /// Image bound through up to three view ids.
    Image { buffer_ids: [u32; 3], used: u32 },
    /// Sampler bound through the sampler table.
    Sampler { sampler_id: u32 },
    /// Group-local pointer; the CB cell receives the specialized
    /// groupshared byte offset.
    Local { sharedmem_offset: u32 },
}

/// Compiled metadata of one kernel argument.
#[derive(Clone, Debug)]
pub struct CompiledArg {
    /// Offset and size of the argument's cell in the inputs CB.
    pub offset: u32,
    pub size: u32,
    pub binding: ArgBinding,
}

/// Printf format table entry.
#[derive(Clone, Debug)]
pub struct PrintfInfo {
    pub format: String,
    pub arg_sizes: Vec<u32>,
}

/// Everything the launch pipeline needs to know about a compiled kernel.
#[derive(Clone, Debug)]
pub struct CompiledKernelInfo {
    pub args: Vec<CompiledArg>,
    pub kernel_inputs_cbv_id: u32,
    pub kernel_inputs_buf_size: u32,
    pub work_properties_cbv_id: u32,
    pub printf_uav_id: Option<u32>,
    pub num_uavs: u32,
    pub num_srvs: u32,
    pub num_samplers: u32,
    pub local_mem_size: u32,
    /// Required work-group size declared on the kernel, if any.
    pub local_size_required: Option<[u16; 3]>,
    pub local_size_hint: Option<[u16; 3]>,
    pub printfs: Vec<PrintfInfo>,
}

/// A kernel lowered to native bytecode.
#[derive(Clone, Debug)]
pub struct CompiledKernel {
    pub bytecode: Vec<u8>,
    pub info: CompiledKernelInfo,
}

/// Per-argument specialization inputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgConfig {
    None,
    Local { size: u32 },
    Sampler {
        normalized_coords: bool,
        linear_filtering: bool,
        addressing_mode: u32,
    },
}

/// The concrete launch shape a kernel is specialized for.
#[derive(Clone, Debug)]
pub struct KernelConfig {
    pub local_size: [u16; 3],
    pub args: Vec<ArgConfig>,
    pub lower_int64: bool,
    pub lower_int16: bool,
    pub support_global_work_offsets: bool,
    pub support_work_group_offsets: bool,
    pub shader_model: u32,
}

/// Work-properties record written once per sub-dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkProperties {
    pub global_offset: [u32; 3],
    pub work_dim: u32,
    pub group_count_total: [u32; 3],
    pub group_id_offset: [u32; 3],
}

/// The external compiler library.
pub trait Compiler: Send + Sync {
    /// Compile OpenCL C into intermediate form.
    fn compile(&self, args: &CompileArgs, log: &BuildLog) -> Result<Arc<dyn ProgramIl>, String>;

    /// Link intermediate objects, optionally into a reusable library.
    fn link(
        &self,
        objects: &[Arc<dyn ProgramIl>],
        create_library: bool,
        log: &BuildLog,
    ) -> Result<Arc<dyn ProgramIl>, String>;

    /// Reload intermediate bytes persisted earlier.
    fn load(&self, bytes: &[u8]) -> Result<Arc<dyn ProgramIl>, String>;

    /// Replace specialization-constant defaults with the given values.
    fn specialize(
        &self,
        il: &dyn ProgramIl,
        values: &SpecConstantValues,
        log: &BuildLog,
    ) -> Result<Arc<dyn ProgramIl>, String>;

    /// Lower one kernel to native bytecode. A missing config produces the
    /// generic variant used for metadata and caching.
    fn get_kernel(
        &self,
        name: &str,
        il: &dyn ProgramIl,
        config: Option<&KernelConfig>,
        log: Option<&BuildLog>,
    ) -> Result<CompiledKernel, String>;

    /// Bytes one work-properties record occupies in the constant buffer.
    fn work_properties_chunk_size(&self) -> usize;

    /// Serialize a record into `out`, which is one chunk long.
    fn copy_work_properties(&self, out: &mut [u8], props: &WorkProperties);

    /// Version stamp for the on-disk shader cache.
    fn version_for_cache(&self) -> u64;
}

/// The external bytecode validator/signer.
pub trait Validator: Send + Sync {
    /// Validate and sign bytecode in place before it may be dispatched.
    fn validate_inplace(&self, bytes: &mut [u8]) -> Result<(), String>;
}
