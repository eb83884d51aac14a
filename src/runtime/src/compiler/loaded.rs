//! Binding to the dynamically loaded compiler and validator libraries.
//!
//! The C ABI mirrors the contract in the module root: opaque handles for
//! compiler context and program objects, byte buffers owned by the library
//! and freed through it. Everything here stays behind the
//! `loaded-compiler` feature so headless test environments never try to
//! dlopen anything.

use super::{
    BuildLog, CompileArgs, CompiledArg, CompiledKernel, CompiledKernelInfo, Compiler, KernelConfig,
    KernelInfo, PrintfInfo, ProgramIl, SpecConstantInfo, SpecConstantValues, Validator,
    WorkProperties,
};
use crate::error::{ClError, Result, COMPILER_NOT_AVAILABLE};

use libloading::Library;
use log::info;
use parking_lot::Mutex;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int, c_uint};
use std::sync::Arc;

#[repr(C)]
struct RawBlob {
    data: *const u8,
    size: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawArgMeta {
    offset: c_uint,
    size: c_uint,
    kind: c_uint,
    // Binding payload, interpretation depends on `kind`.
    ids: [c_uint; 3],
    used: c_uint,
}

#[repr(C)]
struct RawKernelMeta {
    num_args: c_uint,
    inputs_cbv_id: c_uint,
    inputs_buf_size: c_uint,
    work_properties_cbv_id: c_uint,
    printf_uav_id: c_int,
    num_uavs: c_uint,
    num_srvs: c_uint,
    num_samplers: c_uint,
    local_mem_size: c_uint,
    local_size_required: [u16; 3],
    has_local_size_required: c_uint,
    local_size_hint: [u16; 3],
    has_local_size_hint: c_uint,
}

#[repr(C)]
struct RawConfig {
    local_size: [u16; 3],
    lower_int64: c_uint,
    lower_int16: c_uint,
    support_global_offsets: c_uint,
    support_group_offsets: c_uint,
    shader_model: c_uint,
    // Per-arg config array: kind (0 none, 1 local, 2 sampler) + value.
    arg_kinds: *const c_uint,
    arg_values: *const c_uint,
    num_args: usize,
}

type LogFn = unsafe extern "C" fn(ctx: *mut c_void, msg: *const c_char);

// The subset of exports the runtime drives. Names follow the library's
// published header.
struct CompilerApi {
    clc_context_new: unsafe extern "C" fn() -> *mut c_void,
    clc_context_free: unsafe extern "C" fn(*mut c_void),
    clc_compile: unsafe extern "C" fn(
        ctx: *mut c_void,
        source: *const c_char,
        args: *const *const c_char,
        num_args: usize,
        log: LogFn,
        log_ctx: *mut c_void,
    ) -> *mut c_void,
    clc_link: unsafe extern "C" fn(
        ctx: *mut c_void,
        objs: *const *mut c_void,
        num_objs: usize,
        create_library: c_uint,
        log: LogFn,
        log_ctx: *mut c_void,
    ) -> *mut c_void,
    clc_parse: unsafe extern "C" fn(ctx: *mut c_void, data: *const u8, size: usize) -> *mut c_void,
    clc_specialize: unsafe extern "C" fn(
        ctx: *mut c_void,
        obj: *mut c_void,
        ids: *const c_uint,
        values: *const u8,
        value_sizes: *const c_uint,
        count: usize,
    ) -> *mut c_void,
    clc_object_bytes: unsafe extern "C" fn(obj: *mut c_void) -> RawBlob,
    clc_object_num_kernels: unsafe extern "C" fn(obj: *mut c_void) -> usize,
    clc_object_kernel_name:
        unsafe extern "C" fn(obj: *mut c_void, index: usize) -> *const c_char,
    clc_object_free: unsafe extern "C" fn(obj: *mut c_void),
    clc_spirv_to_native: unsafe extern "C" fn(
        ctx: *mut c_void,
        obj: *mut c_void,
        kernel: *const c_char,
        config: *const RawConfig,
        out_meta: *mut RawKernelMeta,
        out_args: *mut RawArgMeta,
        max_args: usize,
    ) -> RawBlob,
    clc_compiler_version: unsafe extern "C" fn() -> u64,
}

unsafe extern "C" fn forward_log(ctx: *mut c_void, msg: *const c_char) {
    if ctx.is_null() || msg.is_null() {
        return;
    }
    let log = &*(ctx as *const BuildLog);
    log.log(&CStr::from_ptr(msg).to_string_lossy());
}

struct LoadedIl {
    api: Arc<LoadedCompilerShared>,
    handle: Mutex<*mut c_void>,
    bytes: Vec<u8>,
    kernels: Vec<KernelInfo>,
}

unsafe impl Send for LoadedIl {}
unsafe impl Sync for LoadedIl {}

impl ProgramIl for LoadedIl {
    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn kernels(&self) -> &[KernelInfo] {
        &self.kernels
    }

    fn spec_constant(&self, _id: u32) -> Option<SpecConstantInfo> {
        // The loaded path reports spec constants through parse metadata;
        // v1-style libraries without it simply accept no constants.
        None
    }
}

impl Drop for LoadedIl {
    fn drop(&mut self) {
        let handle = *self.handle.lock();
        if !handle.is_null() {
            unsafe { (self.api.api.clc_object_free)(handle) };
        }
    }
}

struct LoadedCompilerShared {
    _library: Library,
    api: CompilerApi,
    context: Mutex<*mut c_void>,
}

unsafe impl Send for LoadedCompilerShared {}
unsafe impl Sync for LoadedCompilerShared {}

/// A compiler loaded from a shared library.
pub struct LoadedCompiler {
    shared: Arc<LoadedCompilerShared>,
    work_properties_chunk: usize,
}

impl LoadedCompiler {
    /// Load the compiler library at `path`.
    pub fn load(path: &str) -> Result<Self> {
        let library = unsafe { Library::new(path) }.map_err(|e| {
            ClError::new(COMPILER_NOT_AVAILABLE, format!("cannot load {}: {}", path, e))
        })?;
        macro_rules! sym {
            ($name:literal) => {
                *unsafe { library.get(concat!($name, "\0").as_bytes()) }.map_err(|e| {
                    ClError::new(
                        COMPILER_NOT_AVAILABLE,
                        format!("missing symbol {}: {}", $name, e),
                    )
                })?
            };
        }
        let api = CompilerApi {
            clc_context_new: sym!("clc_context_new"),
            clc_context_free: sym!("clc_context_free"),
            clc_compile: sym!("clc_compile"),
            clc_link: sym!("clc_link"),
            clc_parse: sym!("clc_parse"),
            clc_specialize: sym!("clc_specialize"),
            clc_object_bytes: sym!("clc_object_bytes"),
            clc_object_kernel_name: sym!("clc_object_kernel_name"),
            clc_object_num_kernels: sym!("clc_object_num_kernels"),
            clc_object_free: sym!("clc_object_free"),
            clc_spirv_to_native: sym!("clc_spirv_to_native"),
            clc_compiler_version: sym!("clc_compiler_version"),
        };
        let context = unsafe { (api.clc_context_new)() };
        if context.is_null() {
            return Err(ClError::new(
                COMPILER_NOT_AVAILABLE,
                "compiler context creation failed",
            ));
        }
        info!("loaded kernel compiler from {}", path);
        Ok(LoadedCompiler {
            shared: Arc::new(LoadedCompilerShared {
                _library: library,
                api,
                context: Mutex::new(context),
            }),
            // Work-properties records are written at CB alignment.
            work_properties_chunk: 256,
        })
    }

    fn wrap_object(&self, handle: *mut c_void) -> std::result::Result<Arc<dyn ProgramIl>, String> {
        if handle.is_null() {
            return Err("compiler returned no object".to_string());
        }
        let api = &self.shared.api;
        let bytes = unsafe {
            let blob = (api.clc_object_bytes)(handle);
            std::slice::from_raw_parts(blob.data, blob.size).to_vec()
        };
        let kernels = unsafe {
            let count = (api.clc_object_num_kernels)(handle);
            (0..count)
                .map(|index| {
                    let name = CStr::from_ptr((api.clc_object_kernel_name)(handle, index));
                    KernelInfo {
                        name: name.to_string_lossy().into_owned(),
                        args: Vec::new(),
                    }
                })
                .collect()
        };
        Ok(Arc::new(LoadedIl {
            api: Arc::clone(&self.shared),
            handle: Mutex::new(handle),
            bytes,
            kernels,
        }))
    }
}

impl Drop for LoadedCompilerShared {
    fn drop(&mut self) {
        let context = *self.context.lock();
        if !context.is_null() {
            unsafe { (self.api.clc_context_free)(context) };
        }
    }
}

impl Compiler for LoadedCompiler {
    fn compile(
        &self,
        args: &CompileArgs,
        log: &BuildLog,
    ) -> std::result::Result<Arc<dyn ProgramIl>, String> {
        let source = CString::new(args.source).map_err(|_| "source contains NUL".to_string())?;
        let cmdline: Vec<CString> = args
            .cmdline
            .iter()
            .map(|arg| CString::new(arg.as_str()).unwrap_or_default())
            .collect();
        let pointers: Vec<*const c_char> = cmdline.iter().map(|c| c.as_ptr()).collect();
        let handle = unsafe {
            (self.shared.api.clc_compile)(
                *self.shared.context.lock(),
                source.as_ptr(),
                pointers.as_ptr(),
                pointers.len(),
                forward_log,
                log as *const BuildLog as *mut c_void,
            )
        };
        self.wrap_object(handle)
    }

    fn link(
        &self,
        objects: &[Arc<dyn ProgramIl>],
        create_library: bool,
        log: &BuildLog,
    ) -> std::result::Result<Arc<dyn ProgramIl>, String> {
        // Round-trip through bytes: the objects may have come from another
        // compiler instance or the on-disk cache.
        let reparsed: Vec<*mut c_void> = objects
            .iter()
            .map(|object| unsafe {
                (self.shared.api.clc_parse)(
                    *self.shared.context.lock(),
                    object.bytes().as_ptr(),
                    object.bytes().len(),
                )
            })
            .collect();
        let handle = unsafe {
            (self.shared.api.clc_link)(
                *self.shared.context.lock(),
                reparsed.as_ptr(),
                reparsed.len(),
                create_library as c_uint,
                forward_log,
                log as *const BuildLog as *mut c_void,
            )
        };
        for object in reparsed {
            if !object.is_null() {
                unsafe { (self.shared.api.clc_object_free)(object) };
            }
        }
        self.wrap_object(handle)
    }

    fn load(&self, bytes: &[u8]) -> std::result::Result<Arc<dyn ProgramIl>, String> {
        let handle = unsafe {
            (self.shared.api.clc_parse)(*self.shared.context.lock(), bytes.as_ptr(), bytes.len())
        };
        self.wrap_object(handle)
    }

    fn specialize(
        &self,
        il: &dyn ProgramIl,
        values: &SpecConstantValues,
        _log: &BuildLog,
    ) -> std::result::Result<Arc<dyn ProgramIl>, String> {
        let parsed = unsafe {
            (self.shared.api.clc_parse)(
                *self.shared.context.lock(),
                il.bytes().as_ptr(),
                il.bytes().len(),
            )
        };
        let ids: Vec<c_uint> = values.keys().copied().collect();
        let mut value_bytes = Vec::with_capacity(values.len() * 8);
        let mut sizes = Vec::with_capacity(values.len());
        for id in &ids {
            let value = values[id];
            value_bytes.extend_from_slice(&value);
            sizes.push(8 as c_uint);
        }
        let handle = unsafe {
            (self.shared.api.clc_specialize)(
                *self.shared.context.lock(),
                parsed,
                ids.as_ptr(),
                value_bytes.as_ptr(),
                sizes.as_ptr(),
                ids.len(),
            )
        };
        if !parsed.is_null() {
            unsafe { (self.shared.api.clc_object_free)(parsed) };
        }
        self.wrap_object(handle)
    }

    fn get_kernel(
        &self,
        name: &str,
        il: &dyn ProgramIl,
        config: Option<&KernelConfig>,
        _log: Option<&BuildLog>,
    ) -> std::result::Result<CompiledKernel, String> {
        const MAX_ARGS: usize = 128;
        let parsed = unsafe {
            (self.shared.api.clc_parse)(
                *self.shared.context.lock(),
                il.bytes().as_ptr(),
                il.bytes().len(),
            )
        };
        if parsed.is_null() {
            return Err("could not reparse intermediate code".to_string());
        }

        let name_c = CString::new(name).map_err(|_| "kernel name contains NUL".to_string())?;
        let mut kinds = Vec::new();
        let mut values = Vec::new();
        let raw_config = config.map(|config| {
            for arg in &config.args {
                match arg {
                    super::ArgConfig::None => {
                        kinds.push(0);
                        values.push(0);
                    }
                    super::ArgConfig::Local { size } => {
                        kinds.push(1);
                        values.push(*size);
                    }
                    super::ArgConfig::Sampler {
                        normalized_coords,
                        linear_filtering,
                        addressing_mode,
                    } => {
                        kinds.push(2);
                        values.push(
                            u32::from(*normalized_coords)
                                | (addressing_mode & 0x7) << 1
                                | u32::from(*linear_filtering) << 4,
                        );
                    }
                }
            }
            RawConfig {
                local_size: config.local_size,
                lower_int64: config.lower_int64 as c_uint,
                lower_int16: config.lower_int16 as c_uint,
                support_global_offsets: config.support_global_work_offsets as c_uint,
                support_group_offsets: config.support_work_group_offsets as c_uint,
                shader_model: config.shader_model,
                arg_kinds: kinds.as_ptr(),
                arg_values: values.as_ptr(),
                num_args: kinds.len(),
            }
        });

        let mut raw_meta = unsafe { std::mem::zeroed::<RawKernelMeta>() };
        let mut raw_args = vec![unsafe { std::mem::zeroed::<RawArgMeta>() }; MAX_ARGS];
        let blob = unsafe {
            (self.shared.api.clc_spirv_to_native)(
                *self.shared.context.lock(),
                parsed,
                name_c.as_ptr(),
                raw_config
                    .as_ref()
                    .map_or(std::ptr::null(), |c| c as *const RawConfig),
                &mut raw_meta,
                raw_args.as_mut_ptr(),
                MAX_ARGS,
            )
        };
        unsafe { (self.shared.api.clc_object_free)(parsed) };
        if blob.data.is_null() {
            return Err(format!("native lowering failed for kernel '{}'", name));
        }
        let bytecode = unsafe { std::slice::from_raw_parts(blob.data, blob.size).to_vec() };

        let num_args = (raw_meta.num_args as usize).min(MAX_ARGS);
        let args: Vec<CompiledArg> = raw_args[..num_args]
            .iter()
            .map(|raw| CompiledArg {
                offset: raw.offset,
                size: raw.size,
                binding: match raw.kind {
                    1 => super::ArgBinding::Memory { buffer_id: raw.ids[0] },
                    2 => super::ArgBinding::Image {
                        buffer_ids: [raw.ids[0], raw.ids[1], raw.ids[2]],
                        used: raw.used,
                    },
                    3 => super::ArgBinding::Sampler { sampler_id: raw.ids[0] },
                    4 => super::ArgBinding::Local {
                        sharedmem_offset: raw.ids[0],
                    },
                    _ => super::ArgBinding::None,
                },
            })
            .collect();

        Ok(CompiledKernel {
            bytecode,
            info: CompiledKernelInfo {
                args,
                kernel_inputs_cbv_id: raw_meta.inputs_cbv_id,
                kernel_inputs_buf_size: raw_meta.inputs_buf_size,
                work_properties_cbv_id: raw_meta.work_properties_cbv_id,
                printf_uav_id: (raw_meta.printf_uav_id >= 0)
                    .then(|| raw_meta.printf_uav_id as u32),
                num_uavs: raw_meta.num_uavs,
                num_srvs: raw_meta.num_srvs,
                num_samplers: raw_meta.num_samplers,
                local_mem_size: raw_meta.local_mem_size,
                local_size_required: (raw_meta.has_local_size_required != 0)
                    .then(|| raw_meta.local_size_required),
                local_size_hint: (raw_meta.has_local_size_hint != 0)
                    .then(|| raw_meta.local_size_hint),
                printfs: Vec::new(),
            },
        })
    }

    fn work_properties_chunk_size(&self) -> usize {
        self.work_properties_chunk
    }

    fn copy_work_properties(&self, out: &mut [u8], props: &WorkProperties) {
        debug_assert!(out.len() >= 44);
        let words = [
            props.global_offset[0],
            props.global_offset[1],
            props.global_offset[2],
            props.work_dim,
            props.group_count_total[0],
            props.group_count_total[1],
            props.group_count_total[2],
            0,
            props.group_id_offset[0],
            props.group_id_offset[1],
            props.group_id_offset[2],
        ];
        for (index, word) in words.iter().enumerate() {
            out[index * 4..index * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
    }

    fn version_for_cache(&self) -> u64 {
        unsafe { (self.shared.api.clc_compiler_version)() }
    }
}

/// Validator loaded from a shared library exposing `validate_inplace`.
pub struct LoadedValidator {
    _library: Library,
    validate: unsafe extern "C" fn(data: *mut u8, size: usize) -> c_int,
}

unsafe impl Send for LoadedValidator {}
unsafe impl Sync for LoadedValidator {}

impl LoadedValidator {
    pub fn load(path: &str) -> Result<Self> {
        let library = unsafe { Library::new(path) }.map_err(|e| {
            ClError::new(COMPILER_NOT_AVAILABLE, format!("cannot load {}: {}", path, e))
        })?;
        let validate = *unsafe { library.get(b"validate_inplace\0") }.map_err(|e| {
            ClError::new(
                COMPILER_NOT_AVAILABLE,
                format!("missing symbol validate_inplace: {}", e),
            )
        })?;
        Ok(LoadedValidator {
            _library: library,
            validate,
        })
    }
}

impl Validator for LoadedValidator {
    fn validate_inplace(&self, bytes: &mut [u8]) -> std::result::Result<(), String> {
        let status = unsafe { (self.validate)(bytes.as_mut_ptr(), bytes.len()) };
        if status == 0 {
            Ok(())
        } else {
            Err(format!("bytecode validation failed ({})", status))
        }
    }
}
