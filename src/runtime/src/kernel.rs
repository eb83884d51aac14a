//! Kernels: argument binding over a built program.

use crate::compiler::{AddressSpace, ArgBinding, ArgInfo, CompiledKernelInfo};
use crate::error::{self, ClError, Result};
use crate::program::{KernelData, Program};
use crate::refs::{InternalRef, OwnedRef};
use crate::resource::Resource;
use crate::sampler::Sampler;

use rocl_hal::Backend;

use parking_lot::Mutex;
use std::sync::Arc;

/// A bound kernel argument.
pub enum ArgValue<B: Backend> {
    /// Global/constant memory object; `None` is a null buffer.
    Buffer(Option<OwnedRef<Resource<B>>>),
    /// Sampler argument.
    Sampler(OwnedRef<Sampler<B>>),
    /// Local-memory pointer: only the size is bound.
    Local(usize),
    /// By-value bytes.
    Bytes(Vec<u8>),
}

pub(crate) enum BoundArg<B: Backend> {
    Unset,
    Buffer(Option<OwnedRef<Resource<B>>>),
    Sampler(OwnedRef<Sampler<B>>),
    Local(usize),
    Bytes(Vec<u8>),
}

/// A kernel instance: a name into a built program plus bound arguments.
///
/// A live kernel pins its program: the program cannot be rebuilt until
/// every kernel created from it is released.
pub struct Kernel<B: Backend> {
    program: InternalRef<Program<B>>,
    name: String,
    // Generic metadata; identical argument shape across devices.
    data: Arc<KernelData<B>>,
    pub(crate) args: Mutex<Vec<BoundArg<B>>>,
}

impl<B: Backend> Kernel<B> {
    pub fn create(program: &OwnedRef<Program<B>>, name: &str) -> Result<OwnedRef<Kernel<B>>> {
        if !program.has_successful_build() {
            return Err(ClError::new(
                error::INVALID_PROGRAM_EXECUTABLE,
                "program has no successful build",
            ));
        }
        let data = program.any_kernel_data(name).ok_or_else(|| {
            ClError::new(error::INVALID_KERNEL_NAME, format!("no kernel '{}'", name))
        })?;
        let arg_count = data.generic.info.args.len();
        program.kernel_created();
        Ok(OwnedRef::new(Kernel {
            program: program.internal(),
            name: name.to_string(),
            data,
            args: Mutex::new((0..arg_count).map(|_| BoundArg::Unset).collect()),
        }))
    }

    /// Create one kernel per kernel in the program, the
    /// `clCreateKernelsInProgram` surface.
    pub fn create_all(program: &OwnedRef<Program<B>>) -> Result<Vec<OwnedRef<Kernel<B>>>> {
        program
            .kernel_names()
            .iter()
            .map(|name| Kernel::create(program, name))
            .collect()
    }

    /// Clone the kernel including its bound arguments.
    pub fn clone_kernel(this: &OwnedRef<Kernel<B>>) -> OwnedRef<Kernel<B>> {
        let args = this.args.lock();
        let copied: Vec<BoundArg<B>> = args
            .iter()
            .map(|arg| match arg {
                BoundArg::Unset => BoundArg::Unset,
                BoundArg::Buffer(b) => BoundArg::Buffer(b.clone()),
                BoundArg::Sampler(s) => BoundArg::Sampler(s.clone()),
                BoundArg::Local(size) => BoundArg::Local(*size),
                BoundArg::Bytes(bytes) => BoundArg::Bytes(bytes.clone()),
            })
            .collect();
        this.program.kernel_created();
        OwnedRef::new(Kernel {
            program: this.program.clone(),
            name: this.name.clone(),
            data: Arc::clone(&this.data),
            args: Mutex::new(copied),
        })
    }

    pub fn program(&self) -> &InternalRef<Program<B>> {
        &self.program
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg_count(&self) -> usize {
        self.data.generic.info.args.len()
    }

    /// Source-level info of one argument.
    pub fn arg_info(&self, index: usize) -> Result<ArgInfo> {
        self.data
            .info
            .args
            .get(index)
            .cloned()
            .ok_or_else(|| ClError::new(error::INVALID_ARG_INDEX, "argument index out of range"))
    }

    /// Compiled metadata of the kernel: argument layout, binding ids,
    /// printf table.
    pub fn compiled_info(&self) -> &CompiledKernelInfo {
        &self.data.generic.info
    }

    /// Required work-group size declared on the kernel, if any.
    pub fn required_work_group_size(&self) -> Option<[u16; 3]> {
        self.data.generic.info.local_size_required
    }

    /// Bytes of groupshared memory the kernel itself declares.
    pub fn local_mem_size(&self) -> u64 {
        let static_size = u64::from(self.data.generic.info.local_mem_size);
        let args = self.args.lock();
        static_size
            + args
                .iter()
                .map(|arg| match arg {
                    BoundArg::Local(size) => *size as u64,
                    _ => 0,
                })
                .sum::<u64>()
    }

    pub fn set_arg(&self, index: usize, value: ArgValue<B>) -> Result<()> {
        let info = self.data.generic.info.args.get(index).ok_or_else(|| {
            ClError::new(error::INVALID_ARG_INDEX, "argument index out of range")
        })?;
        let source_info = &self.data.info.args[index];

        let bound = match value {
            ArgValue::Buffer(buffer) => {
                if !matches!(info.binding, ArgBinding::Memory { .. } | ArgBinding::Image { .. }) {
                    return Err(ClError::new(
                        error::INVALID_ARG_VALUE,
                        "argument is not a memory object",
                    ));
                }
                BoundArg::Buffer(buffer)
            }
            ArgValue::Sampler(sampler) => {
                if !matches!(info.binding, ArgBinding::Sampler { .. }) {
                    return Err(ClError::new(
                        error::INVALID_ARG_VALUE,
                        "argument is not a sampler",
                    ));
                }
                BoundArg::Sampler(sampler)
            }
            ArgValue::Local(size) => {
                if source_info.address_space != AddressSpace::Local {
                    return Err(ClError::new(
                        error::INVALID_ARG_VALUE,
                        "argument is not a local pointer",
                    ));
                }
                if size == 0 {
                    return Err(ClError::new(
                        error::INVALID_ARG_SIZE,
                        "local argument size is zero",
                    ));
                }
                BoundArg::Local(size)
            }
            ArgValue::Bytes(bytes) => {
                if !matches!(info.binding, ArgBinding::None) {
                    return Err(ClError::new(
                        error::INVALID_ARG_VALUE,
                        "argument is not by-value",
                    ));
                }
                if bytes.len() != info.size as usize {
                    return Err(ClError::new(
                        error::INVALID_ARG_SIZE,
                        format!("argument expects {} bytes, got {}", info.size, bytes.len()),
                    ));
                }
                BoundArg::Bytes(bytes)
            }
        };

        self.args.lock()[index] = bound;
        Ok(())
    }

    pub fn all_args_set(&self) -> bool {
        self.args
            .lock()
            .iter()
            .all(|arg| !matches!(arg, BoundArg::Unset))
    }
}

impl<B: Backend> Drop for Kernel<B> {
    fn drop(&mut self) {
        self.program.kernel_freed();
    }
}

impl<B: Backend> std::fmt::Debug for Kernel<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Kernel").field("name", &self.name).finish()
    }
}
