//! Programs: build, compile, link, and the specialization cache.

use crate::cache::{hash_parts, ShaderCache};
use crate::compiler::{
    ArgConfig, BuildLog, CompileArgs, CompileFeatures, CompiledKernel, KernelConfig, KernelInfo,
    ProgramIl, SpecConstantValues,
};
use crate::context::Context;
use crate::device::{Device, NativeDevice};
use crate::error::{self, ClError, Result};
use crate::refs::{InternalRef, OwnedRef};

use rocl_hal::Backend;

use fxhash::FxHashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Fixed header identifying an exported program binary blob.
pub const BINARY_HEADER_GUID: [u8; 16] = [
    0x72, 0x6f, 0x63, 0x6c, 0x2d, 0x62, 0x69, 0x6e, 0x61, 0x72, 0x79, 0x2d, 0x76, 0x31, 0x00,
    0x00,
];

/// CL program binary type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryType {
    None,
    CompiledObject,
    Library,
    Executable,
}

impl BinaryType {
    fn to_u32(self) -> u32 {
        match self {
            BinaryType::None => 0,
            BinaryType::CompiledObject => 1,
            BinaryType::Library => 2,
            BinaryType::Executable => 3,
        }
    }

    fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => BinaryType::None,
            1 => BinaryType::CompiledObject,
            2 => BinaryType::Library,
            3 => BinaryType::Executable,
            _ => return None,
        })
    }
}

/// CL build status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildStatus {
    None,
    InProgress,
    Success,
    Error,
}

/// Key of one kernel specialization: the device plus the full bit pattern
/// of the launch configuration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct SpecKey {
    device: usize,
    config_bits: u64,
    args: SmallVec<[u32; 8]>,
}

impl SpecKey {
    pub(crate) fn new<B: Backend>(native: &Arc<NativeDevice<B>>, config: &KernelConfig) -> Self {
        let mut bits = u64::from(config.local_size[0])
            | u64::from(config.local_size[1]) << 16
            | u64::from(config.local_size[2]) << 32;
        if config.lower_int64 {
            bits |= 1 << 48;
        }
        if config.lower_int16 {
            bits |= 1 << 49;
        }
        if config.support_global_work_offsets {
            bits |= 1 << 50;
        }
        if config.support_work_group_offsets {
            bits |= 1 << 51;
        }
        let args = config
            .args
            .iter()
            .map(|arg| match *arg {
                ArgConfig::None => 0,
                ArgConfig::Local { size } => size,
                ArgConfig::Sampler {
                    normalized_coords,
                    linear_filtering,
                    addressing_mode,
                } => {
                    u32::from(normalized_coords)
                        | (addressing_mode & 0x7) << 1
                        | u32::from(linear_filtering) << 4
                }
            })
            .collect();
        SpecKey {
            device: Arc::as_ptr(native) as usize,
            config_bits: bits,
            args,
        }
    }
}

/// A resolved specialization: bytecode plus its pipeline.
pub(crate) struct SpecValue<B: Backend> {
    pub kernel: CompiledKernel,
    pub pso: Arc<B::PipelineState>,
}

/// Everything known about one kernel of a built program on one device.
pub(crate) struct KernelData<B: Backend> {
    pub info: KernelInfo,
    pub generic: CompiledKernel,
    pub spec_cache: Mutex<FxHashMap<SpecKey, Arc<SpecValue<B>>>>,
}

pub(crate) struct PerDeviceBuild<B: Backend> {
    pub device: OwnedRef<Device<B>>,
    pub native: Arc<NativeDevice<B>>,
    pub status: BuildStatus,
    pub log: String,
    pub binary_type: BinaryType,
    pub il: Option<Arc<dyn ProgramIl>>,
    pub kernels: BTreeMap<String, Arc<KernelData<B>>>,
    pub options: String,
    pub pending_links: u32,
}

struct ProgramState<B: Backend> {
    builds: FxHashMap<usize, PerDeviceBuild<B>>,
    live_kernels: u32,
    spec_constants: SpecConstantValues,
}

/// Options accepted by build/compile/link, already tokenized.
#[derive(Clone, Debug, Default)]
struct ParsedOptions {
    defines: Vec<String>,
    create_library: bool,
    raw: String,
}

fn parse_options(options: &str, linker: bool) -> Result<ParsedOptions> {
    let mut parsed = ParsedOptions {
        raw: options.to_string(),
        ..ParsedOptions::default()
    };
    let mut tokens = options.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        match token {
            "-create-library" if linker => parsed.create_library = true,
            "-enable-link-options" if linker => {}
            _ if token.starts_with("-D") => {
                if token == "-D" {
                    match tokens.next() {
                        Some(def) => parsed.defines.push(def.to_string()),
                        None => {
                            return Err(ClError::new(
                                error::INVALID_BUILD_OPTIONS,
                                "-D needs a definition",
                            ))
                        }
                    }
                } else {
                    parsed.defines.push(token[2..].to_string());
                }
            }
            _ if token.starts_with("-I") => {
                if token == "-I" {
                    tokens.next();
                }
            }
            "-cl-single-precision-constant"
            | "-cl-denorms-are-zero"
            | "-cl-fp32-correctly-rounded-divide-sqrt"
            | "-cl-opt-disable"
            | "-cl-mad-enable"
            | "-cl-no-signed-zeros"
            | "-cl-unsafe-math-optimizations"
            | "-cl-finite-math-only"
            | "-cl-fast-relaxed-math"
            | "-cl-kernel-arg-info"
            | "-w"
            | "-Werror" => {}
            _ if token.starts_with("-cl-std=") => {}
            _ => {
                return Err(ClError::new(
                    error::INVALID_BUILD_OPTIONS,
                    format!("unknown option '{}'", token),
                ))
            }
        }
    }
    Ok(parsed)
}

fn features_for<B: Backend>(device: &Device<B>) -> CompileFeatures {
    let features = device.features();
    CompileFeatures {
        fp16: false,
        fp64: false,
        int64: true,
        images: features.images,
        images_read_write: features.images && features.typed_uav_load,
        images_write_3d: features.images,
    }
}

fn feature_bytes(features: &CompileFeatures) -> [u8; 6] {
    [
        features.fp16 as u8,
        features.fp64 as u8,
        features.int64 as u8,
        features.images as u8,
        features.images_read_write as u8,
        features.images_write_3d as u8,
    ]
}

/// A program: source or IL plus per-device build results.
pub struct Program<B: Backend> {
    context: InternalRef<Context<B>>,
    source: Option<String>,
    input_il: Mutex<Option<Arc<dyn ProgramIl>>>,
    state: Mutex<ProgramState<B>>,
}

/// Callback invoked when an asynchronous build/compile/link finishes.
pub type BuildCallback<B> = Box<dyn FnOnce(&OwnedRef<Program<B>>) + Send>;

impl<B: Backend> Program<B> {
    fn new_empty(context: &OwnedRef<Context<B>>, source: Option<String>) -> OwnedRef<Program<B>> {
        OwnedRef::new(Program {
            context: context.internal(),
            source,
            input_il: Mutex::new(None),
            state: Mutex::new(ProgramState {
                builds: FxHashMap::default(),
                live_kernels: 0,
                spec_constants: SpecConstantValues::default(),
            }),
        })
    }

    pub fn create_with_source(
        context: &OwnedRef<Context<B>>,
        source: impl Into<String>,
    ) -> OwnedRef<Program<B>> {
        Self::new_empty(context, Some(source.into()))
    }

    /// Create from intermediate language bytes (`cl_khr_il_program`).
    pub fn create_with_il(
        context: &OwnedRef<Context<B>>,
        il: &[u8],
    ) -> Result<OwnedRef<Program<B>>> {
        let compiler = context.platform().compiler().clone();
        let parsed = compiler
            .load(il)
            .map_err(|e| context.report_error(&e, error::INVALID_VALUE))?;
        let program = Self::new_empty(context, None);
        *program.input_il.lock() = Some(parsed);
        Ok(program)
    }

    /// Create from exported binaries, one per device.
    pub fn create_with_binary(
        context: &OwnedRef<Context<B>>,
        devices: &[OwnedRef<Device<B>>],
        binaries: &[&[u8]],
    ) -> Result<OwnedRef<Program<B>>> {
        if devices.len() != binaries.len() || devices.is_empty() {
            return Err(context.report_error(
                "device and binary counts disagree",
                error::INVALID_VALUE,
            ));
        }
        let compiler = context.platform().compiler().clone();
        let program = Self::new_empty(context, None);
        {
            let mut state = program.state.lock();
            for (device, blob) in devices.iter().zip(binaries) {
                let native = context.native_for(device).ok_or_else(|| {
                    context.report_error(
                        "device not part of this context",
                        error::INVALID_DEVICE,
                    )
                })?;
                let (binary_type, il_bytes) = decode_binary_blob(blob)
                    .ok_or_else(|| context.report_error("bad binary header", error::INVALID_BINARY))?;
                let il = compiler
                    .load(il_bytes)
                    .map_err(|e| context.report_error(&e, error::INVALID_BINARY))?;
                state.builds.insert(
                    device.as_raw() as usize,
                    PerDeviceBuild {
                        device: device.clone(),
                        native,
                        status: BuildStatus::None,
                        log: String::new(),
                        binary_type,
                        il: Some(il),
                        kernels: BTreeMap::new(),
                        options: String::new(),
                        pending_links: 0,
                    },
                );
            }
        }
        Ok(program)
    }

    pub fn context(&self) -> &InternalRef<Context<B>> {
        &self.context
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Set one specialization constant; applies to the next build of an IL
    /// program.
    pub fn set_spec_constant(&self, id: u32, value: &[u8]) -> Result<()> {
        let il = self.input_il.lock();
        let il = il.as_ref().ok_or_else(|| {
            ClError::new(
                error::INVALID_OPERATION,
                "spec constants require an IL program",
            )
        })?;
        let info = il.spec_constant(id).ok_or_else(|| {
            ClError::new(error::INVALID_VALUE, "unknown specialization constant")
        })?;
        if value.len() != info.value_size as usize || value.len() > 8 {
            return Err(ClError::new(
                error::INVALID_VALUE,
                "bad specialization constant size",
            ));
        }
        let mut bytes = [0u8; 8];
        bytes[..value.len()].copy_from_slice(value);
        self.state.lock().spec_constants.insert(id, bytes);
        Ok(())
    }

    fn guard_mutable(&self) -> Result<()> {
        let state = self.state.lock();
        if state.live_kernels > 0 {
            return Err(ClError::new(
                error::INVALID_OPERATION,
                "program has live kernels",
            ));
        }
        if state.builds.values().any(|b| b.pending_links > 0) {
            return Err(ClError::new(
                error::INVALID_OPERATION,
                "program participates in a pending link",
            ));
        }
        Ok(())
    }

    fn target_devices(
        &self,
        devices: Option<&[OwnedRef<Device<B>>]>,
    ) -> Result<Vec<(OwnedRef<Device<B>>, Arc<NativeDevice<B>>)>> {
        let list: Vec<OwnedRef<Device<B>>> = match devices {
            Some(devices) => devices.to_vec(),
            None => self.context.devices(),
        };
        list.into_iter()
            .map(|device| {
                let native = self
                    .context
                    .native_for(&device)
                    .ok_or_else(|| {
                        ClError::new(error::INVALID_DEVICE, "device not in program context")
                    })?;
                Ok((device, native))
            })
            .collect()
    }

    /// Build (compile + link) for the given devices.
    pub fn build(
        this: &OwnedRef<Program<B>>,
        devices: Option<&[OwnedRef<Device<B>>]>,
        options: &str,
        notify: Option<BuildCallback<B>>,
    ) -> Result<()> {
        this.guard_mutable()?;
        let parsed = parse_options(options, false)?;
        let targets = this.target_devices(devices)?;
        {
            let mut state = this.state.lock();
            for (device, native) in &targets {
                let entry = state
                    .builds
                    .entry(device.as_raw() as usize)
                    .or_insert_with(|| PerDeviceBuild {
                        device: device.clone(),
                        native: Arc::clone(native),
                        status: BuildStatus::None,
                        log: String::new(),
                        binary_type: BinaryType::None,
                        il: None,
                        kernels: BTreeMap::new(),
                        options: String::new(),
                        pending_links: 0,
                    });
                entry.status = BuildStatus::InProgress;
                entry.options = parsed.raw.clone();
            }
        }

        match notify {
            Some(notify) => {
                let program = this.clone();
                let targets = targets;
                this.context.platform().queue_program_op(move || {
                    let _ = Program::build_impl(&program, &targets, &parsed);
                    notify(&program);
                });
                Ok(())
            }
            None => Program::build_impl(this, &targets, &parsed),
        }
    }

    fn build_impl(
        this: &OwnedRef<Program<B>>,
        targets: &[(OwnedRef<Device<B>>, Arc<NativeDevice<B>>)],
        options: &ParsedOptions,
    ) -> Result<()> {
        let platform = this.context.platform().clone();
        let compiler = platform.compiler().clone();
        let mut overall: Result<()> = Ok(());

        for (device, native) in targets {
            let log = BuildLog::new();
            let result = (|| -> std::result::Result<Arc<dyn ProgramIl>, String> {
                let existing_il = {
                    let state = this.state.lock();
                    state
                        .builds
                        .get(&(device.as_raw() as usize))
                        .and_then(|b| b.il.clone())
                };
                let input_il = this.input_il.lock().clone();

                let il = if let Some(source) = &this.source {
                    let features = features_for(device);
                    let cache = native.cache();
                    let key = build_cache_key(cache, source, &options.defines, &features);

                    let compiled = match key.and_then(|k| cache.find(k)) {
                        Some(bytes) => compiler.load(&bytes)?,
                        None => {
                            let args = CompileArgs {
                                source,
                                headers: Vec::new(),
                                features,
                                cmdline: options.defines.iter().map(|d| format!("-D{}", d)).collect(),
                            };
                            let object = compiler.compile(&args, &log)?;
                            if let Some(key) = key {
                                cache.store(key, object.bytes());
                            }
                            object
                        }
                    };
                    compiler.link(&[compiled], false, &log)?
                } else if let Some(il) = input_il {
                    let spec_constants = this.state.lock().spec_constants.clone();
                    if spec_constants.is_empty() {
                        il
                    } else {
                        compiler.specialize(&*il, &spec_constants, &log)?
                    }
                } else if let Some(il) = existing_il {
                    il
                } else {
                    return Err("program has no source, IL, or binary".to_string());
                };
                Ok(il)
            })();

            match result {
                Ok(il) => {
                    match create_kernels(&platform, native, &*il, &log) {
                        Ok(kernels) => {
                            let mut state = this.state.lock();
                            let entry = state
                                .builds
                                .get_mut(&(device.as_raw() as usize))
                                .expect("build entry installed by build()");
                            entry.il = Some(il);
                            entry.kernels = kernels;
                            entry.binary_type = BinaryType::Executable;
                            entry.status = BuildStatus::Success;
                            entry.log = log.take();
                        }
                        Err(message) => {
                            set_build_error(this, device, &log, &message);
                            overall = Err(ClError::new(
                                error::BUILD_PROGRAM_FAILURE,
                                message,
                            ));
                        }
                    }
                }
                Err(message) => {
                    set_build_error(this, device, &log, &message);
                    overall = Err(ClError::new(error::BUILD_PROGRAM_FAILURE, message));
                }
            }
        }
        overall
    }

    /// Compile only (no link); the result can feed `link`.
    pub fn compile(
        this: &OwnedRef<Program<B>>,
        devices: Option<&[OwnedRef<Device<B>>]>,
        options: &str,
        headers: &[(String, OwnedRef<Program<B>>)],
        notify: Option<BuildCallback<B>>,
    ) -> Result<()> {
        this.guard_mutable()?;
        let parsed = parse_options(options, false)?;
        let targets = this.target_devices(devices)?;
        let source = this
            .source
            .clone()
            .ok_or_else(|| ClError::new(error::INVALID_OPERATION, "compile needs source"))?;
        let headers: Vec<(String, String)> = headers
            .iter()
            .map(|(name, program)| {
                program
                    .source
                    .clone()
                    .map(|s| (name.clone(), s))
                    .ok_or_else(|| {
                        ClError::new(error::INVALID_OPERATION, "header programs need source")
                    })
            })
            .collect::<Result<_>>()?;

        {
            let mut state = this.state.lock();
            for (device, native) in &targets {
                let entry = state
                    .builds
                    .entry(device.as_raw() as usize)
                    .or_insert_with(|| PerDeviceBuild {
                        device: device.clone(),
                        native: Arc::clone(native),
                        status: BuildStatus::None,
                        log: String::new(),
                        binary_type: BinaryType::None,
                        il: None,
                        kernels: BTreeMap::new(),
                        options: String::new(),
                        pending_links: 0,
                    });
                entry.status = BuildStatus::InProgress;
                entry.options = parsed.raw.clone();
            }
        }

        let work = {
            let program = this.clone();
            move || -> Result<()> {
                let compiler = program.context.platform().compiler().clone();
                let mut overall = Ok(());
                for (device, native) in &targets {
                    let log = BuildLog::new();
                    let features = features_for(device);
                    let cache = native.cache();
                    let mut parts: Vec<&[u8]> = vec![source.as_bytes()];
                    let fb = feature_bytes(&features);
                    parts.push(&fb);
                    for define in &parsed.defines {
                        parts.push(define.as_bytes());
                    }
                    for (name, contents) in &headers {
                        parts.push(name.as_bytes());
                        parts.push(contents.as_bytes());
                    }
                    let key = cache.is_enabled().then(|| hash_parts(&parts));

                    let result = match key.and_then(|k| cache.find(k)) {
                        Some(bytes) => compiler.load(&bytes),
                        None => {
                            let args = CompileArgs {
                                source: &source,
                                headers: headers.clone(),
                                features,
                                cmdline: parsed
                                    .defines
                                    .iter()
                                    .map(|d| format!("-D{}", d))
                                    .collect(),
                            };
                            compiler.compile(&args, &log).map(|object| {
                                if let Some(key) = key {
                                    cache.store(key, object.bytes());
                                }
                                object
                            })
                        }
                    };

                    let mut state = program.state.lock();
                    let entry = state
                        .builds
                        .get_mut(&(device.as_raw() as usize))
                        .expect("entry installed above");
                    match result {
                        Ok(il) => {
                            entry.il = Some(il);
                            entry.binary_type = BinaryType::CompiledObject;
                            entry.status = BuildStatus::Success;
                            entry.log = log.take();
                        }
                        Err(message) => {
                            log.log(&message);
                            entry.status = BuildStatus::Error;
                            entry.log = log.take();
                            overall = Err(ClError::new(error::COMPILE_PROGRAM_FAILURE, message));
                        }
                    }
                }
                overall
            }
        };

        match notify {
            Some(notify) => {
                let program = this.clone();
                this.context.platform().queue_program_op(move || {
                    let _ = work();
                    notify(&program);
                });
                Ok(())
            }
            None => work(),
        }
    }

    /// Link compiled objects (and libraries) into a new program.
    pub fn link(
        context: &OwnedRef<Context<B>>,
        options: &str,
        inputs: &[OwnedRef<Program<B>>],
        notify: Option<BuildCallback<B>>,
    ) -> Result<OwnedRef<Program<B>>> {
        if inputs.is_empty() {
            return Err(ClError::new(error::INVALID_VALUE, "nothing to link"));
        }
        let parsed = parse_options(options, true)?;
        let program = Self::new_empty(context, None);
        let targets: Vec<(OwnedRef<Device<B>>, Arc<NativeDevice<B>>)> = context
            .entries()
            .iter()
            .map(|e| (e.device.clone(), Arc::clone(&e.native)))
            .collect();

        // Inputs may not be rebuilt while the link is outstanding.
        for input in inputs {
            let mut state = input.state.lock();
            for build in state.builds.values_mut() {
                build.pending_links += 1;
            }
        }

        {
            let mut state = program.state.lock();
            for (device, native) in &targets {
                state.builds.insert(
                    device.as_raw() as usize,
                    PerDeviceBuild {
                        device: device.clone(),
                        native: Arc::clone(native),
                        status: BuildStatus::InProgress,
                        log: String::new(),
                        binary_type: BinaryType::None,
                        il: None,
                        kernels: BTreeMap::new(),
                        options: parsed.raw.clone(),
                        pending_links: 0,
                    },
                );
            }
        }

        let inputs: Vec<OwnedRef<Program<B>>> = inputs.to_vec();
        let work = {
            let program = program.clone();
            move || -> Result<()> {
                let platform = program.context.platform().clone();
                let compiler = platform.compiler().clone();
                let mut overall = Ok(());
                for (device, native) in &targets {
                    let log = BuildLog::new();
                    let objects: Vec<Arc<dyn ProgramIl>> = {
                        let mut objects = Vec::with_capacity(inputs.len());
                        for input in &inputs {
                            let state = input.state.lock();
                            match state
                                .builds
                                .get(&(device.as_raw() as usize))
                                .and_then(|b| b.il.clone())
                            {
                                Some(il) => objects.push(il),
                                None => {
                                    objects.clear();
                                    break;
                                }
                            }
                        }
                        objects
                    };

                    let mut state_result: Result<()> = Ok(());
                    if objects.len() != inputs.len() {
                        state_result = Err(ClError::new(
                            error::INVALID_OPERATION,
                            "input program has no object for a context device",
                        ));
                    }

                    let linked = state_result.and_then(|()| {
                        compiler
                            .link(&objects, parsed.create_library, &log)
                            .map_err(|e| ClError::new(error::LINK_PROGRAM_FAILURE, e))
                    });

                    match linked {
                        Ok(il) => {
                            let kernels = if parsed.create_library {
                                Ok(BTreeMap::new())
                            } else {
                                create_kernels(&platform, native, &*il, &log)
                                    .map_err(|e| ClError::new(error::LINK_PROGRAM_FAILURE, e))
                            };
                            match kernels {
                                Ok(kernels) => {
                                    let mut state = program.state.lock();
                                    let entry = state
                                        .builds
                                        .get_mut(&(device.as_raw() as usize))
                                        .expect("installed above");
                                    entry.il = Some(il);
                                    entry.kernels = kernels;
                                    entry.binary_type = if parsed.create_library {
                                        BinaryType::Library
                                    } else {
                                        BinaryType::Executable
                                    };
                                    entry.status = BuildStatus::Success;
                                    entry.log = log.take();
                                }
                                Err(err) => {
                                    set_build_error(&program, device, &log, &err.message);
                                    overall = Err(err);
                                }
                            }
                        }
                        Err(err) => {
                            set_build_error(&program, device, &log, &err.message);
                            overall = Err(err);
                        }
                    }
                }

                for input in &inputs {
                    let mut state = input.state.lock();
                    for build in state.builds.values_mut() {
                        build.pending_links -= 1;
                    }
                }
                overall
            }
        };

        match notify {
            Some(notify) => {
                let handle = program.clone();
                context.platform().queue_program_op(move || {
                    let _ = work();
                    notify(&handle);
                });
                Ok(program)
            }
            None => {
                work()?;
                Ok(program)
            }
        }
    }

    pub fn build_status(&self, device: &OwnedRef<Device<B>>) -> BuildStatus {
        self.state
            .lock()
            .builds
            .get(&(device.as_raw() as usize))
            .map_or(BuildStatus::None, |b| b.status)
    }

    pub fn build_log(&self, device: &OwnedRef<Device<B>>) -> String {
        self.state
            .lock()
            .builds
            .get(&(device.as_raw() as usize))
            .map_or_else(String::new, |b| b.log.clone())
    }

    pub fn build_options(&self, device: &OwnedRef<Device<B>>) -> String {
        self.state
            .lock()
            .builds
            .get(&(device.as_raw() as usize))
            .map_or_else(String::new, |b| b.options.clone())
    }

    pub fn binary_type(&self, device: &OwnedRef<Device<B>>) -> BinaryType {
        self.state
            .lock()
            .builds
            .get(&(device.as_raw() as usize))
            .map_or(BinaryType::None, |b| b.binary_type)
    }

    /// Export `{header, type, size, il}` blobs, one per built device.
    pub fn binaries(&self) -> Vec<(OwnedRef<Device<B>>, Vec<u8>)> {
        let state = self.state.lock();
        state
            .builds
            .values()
            .filter_map(|build| {
                let il = build.il.as_ref()?;
                Some((build.device.clone(), encode_binary_blob(build.binary_type, il.bytes())))
            })
            .collect()
    }

    /// Names of kernels in the built program.
    pub fn kernel_names(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .builds
            .values()
            .find(|b| b.status == BuildStatus::Success)
            .map(|b| b.kernels.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn kernel_data(
        &self,
        device_key: usize,
        name: &str,
    ) -> Option<Arc<KernelData<B>>> {
        let state = self.state.lock();
        state
            .builds
            .get(&device_key)
            .filter(|b| b.status == BuildStatus::Success)
            .and_then(|b| b.kernels.get(name))
            .cloned()
    }

    /// Kernel data on any successfully built device, used for metadata.
    pub(crate) fn any_kernel_data(&self, name: &str) -> Option<Arc<KernelData<B>>> {
        let state = self.state.lock();
        state
            .builds
            .values()
            .filter(|b| b.status == BuildStatus::Success)
            .find_map(|b| b.kernels.get(name).cloned())
    }

    pub fn has_successful_build(&self) -> bool {
        self.state
            .lock()
            .builds
            .values()
            .any(|b| b.status == BuildStatus::Success)
    }

    pub(crate) fn il_for_device(&self, device_key: usize) -> Option<Arc<dyn ProgramIl>> {
        self.state
            .lock()
            .builds
            .get(&device_key)
            .and_then(|b| b.il.clone())
    }

    pub(crate) fn kernel_created(&self) {
        self.state.lock().live_kernels += 1;
    }

    pub(crate) fn kernel_freed(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.live_kernels > 0);
        state.live_kernels -= 1;
    }

    pub fn live_kernel_count(&self) -> u32 {
        self.state.lock().live_kernels
    }

    /// Look up an existing specialization.
    pub(crate) fn find_specialization(
        &self,
        device_key: usize,
        name: &str,
        key: &SpecKey,
    ) -> Option<Arc<SpecValue<B>>> {
        let data = self.kernel_data(device_key, name)?;
        let cache = data.spec_cache.lock();
        cache.get(key).cloned()
    }

    /// Insert a freshly compiled specialization, keeping the first value
    /// if a racing worker beat us to it.
    pub(crate) fn store_specialization(
        &self,
        device_key: usize,
        name: &str,
        key: SpecKey,
        value: SpecValue<B>,
    ) -> Option<Arc<SpecValue<B>>> {
        let data = self.kernel_data(device_key, name)?;
        let mut cache = data.spec_cache.lock();
        Some(Arc::clone(
            cache.entry(key).or_insert_with(|| Arc::new(value)),
        ))
    }
}

fn set_build_error<B: Backend>(
    program: &OwnedRef<Program<B>>,
    device: &OwnedRef<Device<B>>,
    log: &BuildLog,
    message: &str,
) {
    warn!("build failed: {}", message);
    log.log(message);
    let mut state = program.state.lock();
    if let Some(entry) = state.builds.get_mut(&(device.as_raw() as usize)) {
        entry.status = BuildStatus::Error;
        entry.log = log.take();
    }
}

fn build_cache_key(
    cache: &ShaderCache,
    source: &str,
    defines: &[String],
    features: &CompileFeatures,
) -> Option<u128> {
    if !cache.is_enabled() {
        return None;
    }
    let fb = feature_bytes(features);
    let mut parts: Vec<&[u8]> = vec![source.as_bytes(), &fb];
    for define in defines {
        parts.push(define.as_bytes());
    }
    Some(hash_parts(&parts))
}

// Eagerly lower every kernel to its generic bytecode and sign it, so
// metadata queries and the first launch don't pay for a compile.
fn create_kernels<B: Backend>(
    platform: &Arc<crate::platform::Platform<B>>,
    native: &Arc<NativeDevice<B>>,
    il: &dyn ProgramIl,
    log: &BuildLog,
) -> std::result::Result<BTreeMap<String, Arc<KernelData<B>>>, String> {
    let compiler = platform.compiler().clone();
    let validator = platform.validator().clone();
    let _ = native;
    let mut kernels = BTreeMap::new();
    for info in il.kernels() {
        let mut generic = compiler.get_kernel(&info.name, il, None, Some(log))?;
        validator.validate_inplace(&mut generic.bytecode)?;
        debug!("compiled generic bytecode for kernel '{}'", info.name);
        kernels.insert(
            info.name.clone(),
            Arc::new(KernelData {
                info: info.clone(),
                generic,
                spec_cache: Mutex::new(FxHashMap::default()),
            }),
        );
    }
    Ok(kernels)
}

fn encode_binary_blob(binary_type: BinaryType, il: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(16 + 4 + 8 + il.len());
    blob.extend_from_slice(&BINARY_HEADER_GUID);
    blob.extend_from_slice(&binary_type.to_u32().to_le_bytes());
    blob.extend_from_slice(&(il.len() as u64).to_le_bytes());
    blob.extend_from_slice(il);
    blob
}

fn decode_binary_blob(blob: &[u8]) -> Option<(BinaryType, &[u8])> {
    if blob.len() < 28 || blob[..16] != BINARY_HEADER_GUID {
        return None;
    }
    let mut quad = [0u8; 4];
    quad.copy_from_slice(&blob[16..20]);
    let binary_type = BinaryType::from_u32(u32::from_le_bytes(quad))?;
    let mut size = [0u8; 8];
    size.copy_from_slice(&blob[20..28]);
    let size = u64::from_le_bytes(size) as usize;
    let bytes = blob.get(28..28 + size)?;
    Some((binary_type, bytes))
}

impl<B: Backend> std::fmt::Debug for Program<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_blob_round_trip() {
        let blob = encode_binary_blob(BinaryType::Executable, b"spirv-bytes");
        let (ty, bytes) = decode_binary_blob(&blob).unwrap();
        assert_eq!(ty, BinaryType::Executable);
        assert_eq!(bytes, b"spirv-bytes");
    }

    #[test]
    fn bad_header_is_rejected() {
        let mut blob = encode_binary_blob(BinaryType::Library, b"x");
        blob[0] ^= 0xff;
        assert!(decode_binary_blob(&blob).is_none());
    }

    #[test]
    fn options_parser_accepts_defines_and_rejects_junk() {
        let parsed = parse_options("-DFOO=1 -D BAR -cl-mad-enable -I inc", false).unwrap();
        assert_eq!(parsed.defines, vec!["FOO=1".to_string(), "BAR".to_string()]);
        assert!(parse_options("-bogus", false).is_err());
        assert!(parse_options("-create-library", false).is_err());
        assert!(parse_options("-create-library", true).unwrap().create_library);
    }
}
