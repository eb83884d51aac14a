//! CL status codes and the runtime's error type.

use rocl_hal::DeviceError;

use std::fmt;
use thiserror::Error;

/// Raw CL status code. Success is 0, errors are negative.
pub type StatusCode = i32;

pub const SUCCESS: StatusCode = 0;
pub const DEVICE_NOT_FOUND: StatusCode = -1;
pub const DEVICE_NOT_AVAILABLE: StatusCode = -2;
pub const COMPILER_NOT_AVAILABLE: StatusCode = -3;
pub const MEM_OBJECT_ALLOCATION_FAILURE: StatusCode = -4;
pub const OUT_OF_RESOURCES: StatusCode = -5;
pub const OUT_OF_HOST_MEMORY: StatusCode = -6;
pub const PROFILING_INFO_NOT_AVAILABLE: StatusCode = -7;
pub const MEM_COPY_OVERLAP: StatusCode = -8;
pub const BUILD_PROGRAM_FAILURE: StatusCode = -11;
pub const EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST: StatusCode = -14;
pub const COMPILE_PROGRAM_FAILURE: StatusCode = -15;
pub const LINKER_NOT_AVAILABLE: StatusCode = -16;
pub const LINK_PROGRAM_FAILURE: StatusCode = -17;

pub const INVALID_VALUE: StatusCode = -30;
pub const INVALID_DEVICE_TYPE: StatusCode = -31;
pub const INVALID_PLATFORM: StatusCode = -32;
pub const INVALID_DEVICE: StatusCode = -33;
pub const INVALID_CONTEXT: StatusCode = -34;
pub const INVALID_QUEUE_PROPERTIES: StatusCode = -35;
pub const INVALID_COMMAND_QUEUE: StatusCode = -36;
pub const INVALID_HOST_PTR: StatusCode = -37;
pub const INVALID_MEM_OBJECT: StatusCode = -38;
pub const INVALID_IMAGE_FORMAT_DESCRIPTOR: StatusCode = -39;
pub const INVALID_IMAGE_SIZE: StatusCode = -40;
pub const INVALID_SAMPLER: StatusCode = -41;
pub const INVALID_BINARY: StatusCode = -42;
pub const INVALID_BUILD_OPTIONS: StatusCode = -43;
pub const INVALID_PROGRAM: StatusCode = -44;
pub const INVALID_PROGRAM_EXECUTABLE: StatusCode = -45;
pub const INVALID_KERNEL_NAME: StatusCode = -46;
pub const INVALID_KERNEL_DEFINITION: StatusCode = -47;
pub const INVALID_KERNEL: StatusCode = -48;
pub const INVALID_ARG_INDEX: StatusCode = -49;
pub const INVALID_ARG_VALUE: StatusCode = -50;
pub const INVALID_ARG_SIZE: StatusCode = -51;
pub const INVALID_KERNEL_ARGS: StatusCode = -52;
pub const INVALID_WORK_DIMENSION: StatusCode = -53;
pub const INVALID_WORK_GROUP_SIZE: StatusCode = -54;
pub const INVALID_WORK_ITEM_SIZE: StatusCode = -55;
pub const INVALID_GLOBAL_OFFSET: StatusCode = -56;
pub const INVALID_EVENT_WAIT_LIST: StatusCode = -57;
pub const INVALID_EVENT: StatusCode = -58;
pub const INVALID_OPERATION: StatusCode = -59;
pub const INVALID_BUFFER_SIZE: StatusCode = -61;
pub const INVALID_GLOBAL_WORK_SIZE: StatusCode = -63;
pub const INVALID_PROPERTY: StatusCode = -64;

/// The error every API entry point surfaces: a CL status code plus a
/// human-readable message the context error reporter also forwards to the
/// application callback.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub struct ClError {
    pub code: StatusCode,
    pub message: String,
}

impl ClError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        ClError {
            code,
            message: message.into(),
        }
    }

    pub fn code_only(code: StatusCode) -> Self {
        ClError {
            code,
            message: String::new(),
        }
    }
}

impl fmt::Display for ClError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "CL error {}", self.code)
        } else {
            write!(f, "CL error {}: {}", self.code, self.message)
        }
    }
}

impl From<DeviceError> for ClError {
    fn from(err: DeviceError) -> Self {
        let code = match err {
            DeviceError::OutOfHostMemory => OUT_OF_HOST_MEMORY,
            DeviceError::OutOfDeviceMemory | DeviceError::DeviceLost => OUT_OF_RESOURCES,
        };
        ClError::new(code, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_errors_map_to_cl_codes() {
        assert_eq!(ClError::from(DeviceError::OutOfHostMemory).code, OUT_OF_HOST_MEMORY);
        assert_eq!(ClError::from(DeviceError::DeviceLost).code, OUT_OF_RESOURCES);
    }
}
