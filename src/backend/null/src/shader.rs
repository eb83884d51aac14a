//! The null backend's "native bytecode" format.
//!
//! Real backends consume driver bytecode produced by the external compiler;
//! the null backend consumes a small serialized description instead, which
//! the test compiler emits. The blob carries the same metadata a compiled
//! kernel would: the constant-buffer layout of its arguments, the binding
//! ids, the specialized thread-group size, and which built-in body to run.

use serde::{Deserialize, Serialize};

/// Kernel bodies the null backend can execute, enough to cover the
/// end-to-end scenarios.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelBody {
    /// `dst[gid.x] = gid.x`
    StoreGlobalId { dst_uav: u32 },
    /// `dst[gid.x] = a[gid.x] + b[gid.x]` over u32 elements.
    AddU32 { a_uav: u32, b_uav: u32, dst_uav: u32 },
    /// `dst[gid.x] = src[gid.x]`
    CopyU32 { src_uav: u32, dst_uav: u32 },
    /// `dst[gid.x] = src[gid.x] * factor` where `factor` is the scalar
    /// argument at the given index.
    ScaleU32 {
        src_uav: u32,
        dst_uav: u32,
        factor_arg: u32,
    },
    /// Appends a `(format_id, gid.x)` record to the printf buffer.
    PrintfGlobalId { format_id: u32 },
    /// Does nothing; used for argument-plumbing tests.
    Nop,
}

/// One argument slot in the kernel-inputs constant buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobArg {
    /// Byte offset of the argument inside the inputs constant buffer.
    pub offset: u32,
    /// Size the runtime must copy for by-value arguments.
    pub size: u32,
    pub kind: BlobArgKind,
}

/// How an argument reaches the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobArgKind {
    /// Copied by value into the constant buffer.
    Scalar,
    /// Buffer bound through the UAV table at this id.
    BufferUav { id: u32 },
    /// Buffer bound through the SRV table at this id.
    BufferSrv { id: u32 },
    /// Sampler bound through the sampler table at this id.
    Sampler { id: u32 },
    /// Group-local pointer; the constant buffer cell receives the
    /// specialized groupshared byte offset.
    Local,
}

/// The deserialized pipeline the null device executes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderBlob {
    pub body: KernelBody,
    pub args: Vec<BlobArg>,
    /// Root slot of the kernel-inputs constant buffer.
    pub inputs_cbv: u32,
    /// Root slot of the per-dispatch work-properties constant buffer.
    pub work_properties_cbv: u32,
    /// Specialized thread-group size.
    pub local_size: [u16; 3],
    /// UAV id of the printf buffer, when the kernel prints.
    pub printf_uav: Option<u32>,
}

impl ShaderBlob {
    /// Serialize into the byte form `create_compute_pipeline` accepts.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("shader blob serialization cannot fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        bincode::deserialize(bytes).map_err(|e| e.to_string())
    }
}

/// Work-properties record layout shared with the runtime's launch pipeline:
/// eleven u32 values, one record per sub-dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkProperties {
    pub global_offset: [u32; 3],
    pub work_dim: u32,
    pub group_count_total: [u32; 3],
    pub padding: u32,
    pub group_id_offset: [u32; 3],
}

impl WorkProperties {
    pub const SIZE: usize = 44;

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut words = [0u32; 11];
        for (i, word) in words.iter_mut().enumerate() {
            let mut quad = [0u8; 4];
            quad.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            *word = u32::from_le_bytes(quad);
        }
        WorkProperties {
            global_offset: [words[0], words[1], words[2]],
            work_dim: words[3],
            group_count_total: [words[4], words[5], words[6]],
            padding: words[7],
            group_id_offset: [words[8], words[9], words[10]],
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let words = [
            self.global_offset[0],
            self.global_offset[1],
            self.global_offset[2],
            self.work_dim,
            self.group_count_total[0],
            self.group_count_total[1],
            self.group_count_total[2],
            self.padding,
            self.group_id_offset[0],
            self.group_id_offset[1],
            self.group_id_offset[2],
        ];
        let mut out = [0u8; Self::SIZE];
        for (i, word) in words.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trips() {
        let blob = ShaderBlob {
            body: KernelBody::AddU32 {
                a_uav: 0,
                b_uav: 1,
                dst_uav: 2,
            },
            args: vec![
                BlobArg {
                    offset: 0,
                    size: 8,
                    kind: BlobArgKind::BufferUav { id: 0 },
                },
                BlobArg {
                    offset: 8,
                    size: 4,
                    kind: BlobArgKind::Scalar,
                },
            ],
            inputs_cbv: 0,
            work_properties_cbv: 1,
            local_size: [64, 1, 1],
            printf_uav: None,
        };
        let decoded = ShaderBlob::from_bytes(&blob.to_bytes()).unwrap();
        assert_eq!(decoded, blob);
    }

    #[test]
    fn work_properties_round_trip() {
        let props = WorkProperties {
            global_offset: [1, 2, 3],
            work_dim: 2,
            group_count_total: [100, 1, 1],
            padding: 0,
            group_id_offset: [64, 0, 0],
        };
        assert_eq!(WorkProperties::from_bytes(&props.to_bytes()), props);
    }
}
