//! Shared test harness: a compiler targeting the null backend's
//! interpreter, plus platform/context/queue setup.

#![allow(dead_code)]

use rocl::compiler::{
    ArgBinding, ArgConfig, ArgInfo, BuildLog, CompileArgs, CompiledArg, CompiledKernel,
    CompiledKernelInfo, Compiler, KernelConfig, KernelInfo, PrintfInfo, ProgramIl,
    SpecConstantInfo, SpecConstantValues, Validator, WorkProperties,
};
use rocl::compiler::AddressSpace;
use rocl::{CommandQueue, Context, Device, OwnedRef, Platform, PlatformOptions, QueueProperties};

use rocl_backend_null::shader::{BlobArg, BlobArgKind, KernelBody, ShaderBlob};
use rocl_backend_null::{AdapterOptions, Backend as Null, Instance};

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const QUEUE_PROPERTIES_KEY: u64 = 0x1093;

// ---------------------------------------------------------------------------
// Test kernel "source language": plain OpenCL C, with the body recognized
// by pattern so the interpreter backend can execute it.

#[derive(Clone, Debug)]
enum ParsedArgKind {
    Buffer,
    Scalar { size: u32 },
    Local,
    Sampler,
}

#[derive(Clone, Debug)]
struct ParsedArg {
    name: String,
    type_name: String,
    kind: ParsedArgKind,
}

#[derive(Clone, Debug)]
struct ParsedKernel {
    name: String,
    args: Vec<ParsedArg>,
    body: KernelBody,
    required_size: Option<[u16; 3]>,
    has_printf: bool,
    printf_format: String,
}

fn parse_kernels(source: &str) -> Result<Vec<ParsedKernel>, String> {
    let mut kernels = Vec::new();
    let mut cursor = 0usize;
    while let Some(at) = source[cursor..].find("kernel") {
        let start = cursor + at;
        cursor = start + "kernel".len();

        let rest = &source[start..];
        let required_size = rest.find("reqd_work_group_size(").and_then(|attr| {
            let open = start + attr + "reqd_work_group_size(".len();
            let close = source[open..].find(')')? + open;
            let mut dims = [1u16; 3];
            for (index, token) in source[open..close].split(',').enumerate().take(3) {
                dims[index] = token.trim().parse().ok()?;
            }
            Some(dims)
        });

        let void_at = match rest.find("void") {
            Some(v) => start + v + "void".len(),
            None => continue,
        };
        let paren = match source[void_at..].find('(') {
            Some(p) => void_at + p,
            None => continue,
        };
        let name = source[void_at..paren].trim().to_string();
        let close = match source[paren..].find(')') {
            Some(c) => paren + c,
            None => return Err("unterminated parameter list".to_string()),
        };
        let body_open = match source[close..].find('{') {
            Some(b) => close + b,
            None => return Err("kernel without a body".to_string()),
        };
        let mut depth = 0usize;
        let mut body_close = body_open;
        for (index, c) in source[body_open..].char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        body_close = body_open + index;
                        break;
                    }
                }
                _ => {}
            }
        }
        let body_text = &source[body_open..=body_close];

        let mut args = Vec::new();
        let params = &source[paren + 1..close];
        for param in params.split(',') {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            let name = param
                .rsplit(|c: char| c == '*' || c.is_whitespace())
                .next()
                .unwrap_or("")
                .to_string();
            let type_name = param[..param.len() - name.len()].trim().to_string();
            let kind = if param.contains("sampler_t") {
                ParsedArgKind::Sampler
            } else if param.contains('*') && param.contains("local") {
                ParsedArgKind::Local
            } else if param.contains('*') || param.contains("image") {
                ParsedArgKind::Buffer
            } else {
                let size = if param.contains("long") || param.contains("double") {
                    8
                } else if param.contains("short") {
                    2
                } else if param.contains("char") {
                    1
                } else {
                    4
                };
                ParsedArgKind::Scalar { size }
            };
            args.push(ParsedArg {
                name,
                type_name,
                kind,
            });
        }

        // Recognize the body.
        let buffer_indices: Vec<usize> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| matches!(a.kind, ParsedArgKind::Buffer))
            .map(|(i, _)| i)
            .collect();
        let scalar_index = args
            .iter()
            .position(|a| matches!(a.kind, ParsedArgKind::Scalar { .. }));

        let has_printf = body_text.contains("printf(");
        let printf_format = if has_printf {
            let quote = body_text.find('"').map(|q| q + 1).unwrap_or(0);
            let end = body_text[quote..].find('"').map(|e| quote + e).unwrap_or(quote);
            body_text[quote..end]
                .replace("\\n", "\n")
                .replace("\\t", "\t")
        } else {
            String::new()
        };

        // UAV ids are assigned to buffer args in declaration order.
        let uav_of = |arg_position: usize| -> u32 {
            buffer_indices
                .iter()
                .position(|&i| i == arg_position)
                .expect("buffer arg") as u32
        };

        let body = if has_printf {
            KernelBody::PrintfGlobalId { format_id: 1 }
        } else if body_text.contains('+') && buffer_indices.len() >= 3 {
            KernelBody::AddU32 {
                a_uav: uav_of(buffer_indices[0]),
                b_uav: uav_of(buffer_indices[1]),
                dst_uav: uav_of(buffer_indices[2]),
            }
        } else if body_text.contains('*') && scalar_index.is_some() && buffer_indices.len() >= 2 {
            KernelBody::ScaleU32 {
                src_uav: uav_of(buffer_indices[0]),
                dst_uav: uav_of(buffer_indices[1]),
                factor_arg: scalar_index.unwrap() as u32,
            }
        } else if body_text.contains("= get_global_id(0)")
            || body_text.contains("=get_global_id(0)")
        {
            KernelBody::StoreGlobalId {
                dst_uav: uav_of(buffer_indices[0]),
            }
        } else if buffer_indices.len() >= 2 && body_text.contains('=') {
            KernelBody::CopyU32 {
                src_uav: uav_of(buffer_indices[0]),
                dst_uav: uav_of(buffer_indices[1]),
            }
        } else {
            KernelBody::Nop
        };

        kernels.push(ParsedKernel {
            name,
            args,
            body,
            required_size,
            has_printf,
            printf_format,
        });
    }
    if kernels.is_empty() {
        return Err("no kernels in source".to_string());
    }
    Ok(kernels)
}

struct TestIl {
    source: String,
    kernels: Vec<ParsedKernel>,
    infos: Vec<KernelInfo>,
}

impl TestIl {
    fn from_source(source: &str) -> Result<Arc<Self>, String> {
        let kernels = parse_kernels(source)?;
        let infos = kernels
            .iter()
            .map(|k| KernelInfo {
                name: k.name.clone(),
                args: k
                    .args
                    .iter()
                    .map(|a| ArgInfo {
                        name: a.name.clone(),
                        type_name: a.type_name.clone(),
                        address_space: match a.kind {
                            ParsedArgKind::Buffer => AddressSpace::Global,
                            ParsedArgKind::Local => AddressSpace::Local,
                            _ => AddressSpace::Private,
                        },
                        readable: true,
                        writable: matches!(a.kind, ParsedArgKind::Buffer),
                        is_const: false,
                    })
                    .collect(),
            })
            .collect();
        Ok(Arc::new(TestIl {
            source: source.to_string(),
            kernels,
            infos,
        }))
    }
}

impl ProgramIl for TestIl {
    fn bytes(&self) -> &[u8] {
        self.source.as_bytes()
    }

    fn kernels(&self) -> &[KernelInfo] {
        &self.infos
    }

    fn spec_constant(&self, _id: u32) -> Option<SpecConstantInfo> {
        None
    }
}

/// Compiler producing interpreter blobs for the null backend. Counts its
/// entry-point invocations so cache tests can observe hits.
pub struct TestCompiler {
    compiles: AtomicUsize,
    links: AtomicUsize,
    kernels_compiled: AtomicUsize,
}

impl TestCompiler {
    pub fn new() -> Arc<Self> {
        Arc::new(TestCompiler {
            compiles: AtomicUsize::new(0),
            links: AtomicUsize::new(0),
            kernels_compiled: AtomicUsize::new(0),
        })
    }

    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn link_count(&self) -> usize {
        self.links.load(Ordering::SeqCst)
    }

    pub fn kernel_compile_count(&self) -> usize {
        self.kernels_compiled.load(Ordering::SeqCst)
    }
}

impl Compiler for TestCompiler {
    fn compile(
        &self,
        args: &CompileArgs,
        log: &BuildLog,
    ) -> Result<Arc<dyn ProgramIl>, String> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if args.source.contains("#error") {
            log.log("fatal: #error directive");
            return Err("compile failed: #error".to_string());
        }
        TestIl::from_source(args.source).map(|il| il as Arc<dyn ProgramIl>)
    }

    fn link(
        &self,
        objects: &[Arc<dyn ProgramIl>],
        _create_library: bool,
        _log: &BuildLog,
    ) -> Result<Arc<dyn ProgramIl>, String> {
        self.links.fetch_add(1, Ordering::SeqCst);
        let combined = objects
            .iter()
            .map(|o| String::from_utf8_lossy(o.bytes()).into_owned())
            .collect::<Vec<_>>()
            .join("\n");
        TestIl::from_source(&combined).map(|il| il as Arc<dyn ProgramIl>)
    }

    fn load(&self, bytes: &[u8]) -> Result<Arc<dyn ProgramIl>, String> {
        let source = std::str::from_utf8(bytes).map_err(|_| "bad IL".to_string())?;
        TestIl::from_source(source).map(|il| il as Arc<dyn ProgramIl>)
    }

    fn specialize(
        &self,
        il: &dyn ProgramIl,
        _values: &SpecConstantValues,
        _log: &BuildLog,
    ) -> Result<Arc<dyn ProgramIl>, String> {
        self.load(il.bytes())
    }

    fn get_kernel(
        &self,
        name: &str,
        il: &dyn ProgramIl,
        config: Option<&KernelConfig>,
        _log: Option<&BuildLog>,
    ) -> Result<CompiledKernel, String> {
        self.kernels_compiled.fetch_add(1, Ordering::SeqCst);
        let source = std::str::from_utf8(il.bytes()).map_err(|_| "bad IL".to_string())?;
        let kernels = parse_kernels(source)?;
        let kernel = kernels
            .iter()
            .find(|k| k.name == name)
            .ok_or_else(|| format!("unknown kernel '{}'", name))?;

        // Lay out the inputs constant buffer and binding tables.
        let mut args = Vec::new();
        let mut blob_args = Vec::new();
        let mut offset = 0u32;
        let mut uav_id = 0u32;
        let mut sampler_id = 0u32;
        let mut sharedmem = 0u32;
        for (index, arg) in kernel.args.iter().enumerate() {
            let (size, binding, blob_kind) = match arg.kind {
                ParsedArgKind::Buffer => {
                    let id = uav_id;
                    uav_id += 1;
                    (
                        4,
                        ArgBinding::Memory { buffer_id: id },
                        BlobArgKind::BufferUav { id },
                    )
                }
                ParsedArgKind::Scalar { size } => (size, ArgBinding::None, BlobArgKind::Scalar),
                ParsedArgKind::Local => {
                    let assigned = sharedmem;
                    if let Some(config) = config {
                        if let Some(ArgConfig::Local { size }) = config.args.get(index) {
                            sharedmem += (size + 15) & !15;
                        }
                    }
                    (
                        4,
                        ArgBinding::Local {
                            sharedmem_offset: assigned,
                        },
                        BlobArgKind::Local,
                    )
                }
                ParsedArgKind::Sampler => {
                    let id = sampler_id;
                    sampler_id += 1;
                    (
                        0,
                        ArgBinding::Sampler { sampler_id: id },
                        BlobArgKind::Sampler { id },
                    )
                }
            };
            let align = size.max(1).min(8);
            offset = (offset + align - 1) / align * align;
            args.push(CompiledArg {
                offset,
                size,
                binding,
            });
            blob_args.push(BlobArg {
                offset,
                size,
                kind: blob_kind,
            });
            offset += size;
        }
        let inputs_buf_size = ((offset.max(4) + 15) / 16) * 16;

        let printf_uav = kernel.has_printf.then(|| uav_id);
        let num_uavs = uav_id + u32::from(kernel.has_printf);

        let local_size = config
            .map(|c| c.local_size)
            .or(kernel.required_size)
            .unwrap_or([1, 1, 1]);

        let blob = ShaderBlob {
            body: kernel.body,
            args: blob_args,
            inputs_cbv: 0,
            work_properties_cbv: 1,
            local_size,
            printf_uav,
        };

        Ok(CompiledKernel {
            bytecode: blob.to_bytes(),
            info: CompiledKernelInfo {
                args,
                kernel_inputs_cbv_id: 0,
                kernel_inputs_buf_size: inputs_buf_size,
                work_properties_cbv_id: 1,
                printf_uav_id: printf_uav,
                num_uavs,
                num_srvs: 0,
                num_samplers: sampler_id,
                local_mem_size: 0,
                local_size_required: kernel.required_size,
                local_size_hint: None,
                printfs: if kernel.has_printf {
                    vec![PrintfInfo {
                        format: kernel.printf_format.clone(),
                        arg_sizes: vec![4],
                    }]
                } else {
                    Vec::new()
                },
            },
        })
    }

    fn work_properties_chunk_size(&self) -> usize {
        256
    }

    fn copy_work_properties(&self, out: &mut [u8], props: &WorkProperties) {
        let record = rocl_backend_null::shader::WorkProperties {
            global_offset: props.global_offset,
            work_dim: props.work_dim,
            group_count_total: props.group_count_total,
            padding: 0,
            group_id_offset: props.group_id_offset,
        };
        out[..44].copy_from_slice(&record.to_bytes());
    }

    fn version_for_cache(&self) -> u64 {
        7
    }
}

/// Validator that accepts everything; bytecode is already in final form.
pub struct TestValidator;

impl Validator for TestValidator {
    fn validate_inplace(&self, _bytes: &mut [u8]) -> Result<(), String> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness

pub struct Harness {
    pub platform: Arc<Platform<Null>>,
    pub compiler: Arc<TestCompiler>,
    pub context: OwnedRef<Context<Null>>,
    pub device: OwnedRef<Device<Null>>,
    pub queue: OwnedRef<CommandQueue<Null>>,
}

pub fn queue_props(bits: QueueProperties) -> Vec<u64> {
    vec![QUEUE_PROPERTIES_KEY, bits.bits(), 0]
}

pub fn harness() -> Harness {
    harness_with(vec![AdapterOptions::default()], None, QueueProperties::empty())
}

pub fn harness_with(
    adapters: Vec<AdapterOptions>,
    cache_dir: Option<PathBuf>,
    queue_bits: QueueProperties,
) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let compiler = TestCompiler::new();
    let platform = Platform::new(
        Instance::new(adapters),
        compiler.clone(),
        Arc::new(TestValidator),
        PlatformOptions { cache_dir },
    );
    let device = platform.devices()[0].clone();
    let context = Context::create(&platform, &[device.clone()], Vec::new(), None).unwrap();
    let queue =
        CommandQueue::create(&context, &device, queue_props(queue_bits), false).unwrap();
    Harness {
        platform,
        compiler,
        context,
        device,
        queue,
    }
}

/// Build a program from source on the harness device, synchronously.
pub fn build_program(h: &Harness, source: &str) -> OwnedRef<rocl::Program<Null>> {
    let program = rocl::Program::create_with_source(&h.context, source);
    rocl::Program::build(&program, None, "", None).unwrap();
    program
}

/// Read a buffer of `n` u32 values after finishing the queue.
pub fn read_u32s(h: &Harness, buffer: &OwnedRef<rocl::Resource<Null>>, n: usize) -> Vec<u32> {
    let mut bytes = vec![0u8; n * 4];
    rocl::read_buffer_blocking(&h.queue, buffer, 0, &mut bytes, &[]).unwrap();
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn u32s_to_bytes(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
