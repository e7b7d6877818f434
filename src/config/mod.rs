use super::address;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Size of a shared memory bank word in bytes.
pub static WORD_SIZE: address = 4;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read config {path:?}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// GPU microarchitecture generation used for global memory coalescing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    GT200 = 13,
    Fermi = 20,
}

/// How child kernels are launched from device code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum::AsRefStr)]
pub enum ChildLaunchModel {
    /// Classic dynamic parallelism: every launch is a new kernel.
    Cdp,
    /// Dynamic thread block launch: child blocks are coalesced into
    /// aggregated groups of an already running kernel.
    Dtbl,
    /// Device kernel coalescing through a hardware kernel queue.
    Dkc,
}

/// Policy for bypassing cache accesses to constant-like child parameters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstantSharingMode {
    #[default]
    Off,
    /// Bypass only for instructions selected by the per-application table.
    Selective,
    Always,
}

/// Configuration of a single SIMT core and the launch machinery around it.
#[allow(clippy::struct_excessive_bools)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GPU {
    /// shader core pipeline warp size
    pub warp_size: usize,
    /// num threads per shader core pipeline
    pub max_threads_per_core: usize,
    /// max concurrent thread blocks per shader core
    pub max_concurrent_blocks_per_core: usize,
    /// max barriers per thread block
    pub max_barriers_per_block: usize,
    /// number of issued instructions waiting for execution
    pub issue_width: usize,

    /// Number of banks in the shared memory in each shader core
    pub shared_memory_num_banks: usize,
    /// Limit shared memory to do one broadcast per cycle
    pub shared_memory_limited_broadcast: bool,
    /// Number of portions a warp is divided into for shared memory bank conflict check
    pub shared_memory_warp_parts: usize,

    /// line size of the per-shader read-only L1 texture cache
    pub tex_cache_l1_line_size: u64,
    /// line size of the per-shader read-only L1 constant memory cache
    pub const_cache_l1_line_size: u64,
    /// Coalescing arch
    pub coalescing_arch: Architecture,
    /// route kernel parameter loads through the unified L1
    pub param_access_unified_l1: bool,

    /// child kernel launch model
    pub child_launch: ChildLaunchModel,
    /// wake parents as soon as their children finish
    pub child_aware_scheduling: bool,
    /// alignment of child parameter buffers in bytes
    pub child_parameter_buffer_alignment: u64,
    /// global constant pointer sharing
    pub global_constant_pointer_sharing: ConstantSharingMode,
    /// name of the running application, used for selective sharing
    pub application: Option<String>,

    /// keep coalesced kernel parameters on chip
    pub dcc_kernel_param_onchip: bool,
    /// on-chip parameter buffer size in bytes
    pub max_param_buffer_size: u64,
    /// release the full flag below this percentage of the parameter buffer
    pub param_buffer_threshold_low: u64,
    /// number of hardware kernel queue entries
    pub kernel_queue_entries: usize,
    /// kernel launch latency in cycles
    pub kernel_launch_latency: u64,
}

impl Default for GPU {
    fn default() -> Self {
        Self {
            warp_size: 32,
            max_threads_per_core: 2048,
            max_concurrent_blocks_per_core: 32,
            max_barriers_per_block: 16,
            issue_width: 2,
            shared_memory_num_banks: 32,
            shared_memory_limited_broadcast: false,
            shared_memory_warp_parts: 1,
            tex_cache_l1_line_size: 128,
            const_cache_l1_line_size: 64,
            coalescing_arch: Architecture::GT200,
            param_access_unified_l1: false,
            child_launch: ChildLaunchModel::Cdp,
            child_aware_scheduling: false,
            child_parameter_buffer_alignment: 8,
            global_constant_pointer_sharing: ConstantSharingMode::Off,
            application: None,
            dcc_kernel_param_onchip: false,
            max_param_buffer_size: 64 * 1024,
            param_buffer_threshold_low: 50,
            kernel_queue_entries: 32,
            kernel_launch_latency: 0,
        }
    }
}

/// Round `n` up to the next multiple of `k`.
#[must_use]
pub fn pad_to_multiple(n: u64, k: u64) -> u64 {
    let rem = n % k;
    if rem == 0 {
        n
    } else {
        ((n / k) + 1) * k
    }
}

impl GPU {
    #[must_use]
    pub fn shared_mem_bank(&self, addr: address) -> address {
        let num_banks = self.shared_memory_num_banks as u64;
        (addr / WORD_SIZE) % num_banks
    }

    #[must_use]
    pub fn max_warps_per_core(&self) -> usize {
        self.max_threads_per_core.div_ceil(self.warp_size)
    }

    /// Size of a child parameter buffer after alignment.
    #[must_use]
    pub fn align_param_size(&self, size: u64) -> u64 {
        pad_to_multiple(size, self.child_parameter_buffer_alignment.max(1))
    }

    /// Checks the invariants the execution core relies on.
    pub fn validate(&self) -> Result<(), Error> {
        if self.warp_size == 0 || self.warp_size > crate::warp::MAX_WARP_SIZE {
            return Err(Error::Invalid(format!(
                "warp size {} must be in 1..={}",
                self.warp_size,
                crate::warp::MAX_WARP_SIZE
            )));
        }
        if self.shared_memory_warp_parts == 0 || self.warp_size % self.shared_memory_warp_parts != 0
        {
            return Err(Error::Invalid(format!(
                "warp size {} is not divisible into {} shared memory parts",
                self.warp_size, self.shared_memory_warp_parts
            )));
        }
        if self.issue_width == 0 {
            return Err(Error::Invalid("issue stage needs at least one register".into()));
        }
        if self.shared_memory_num_banks == 0 {
            return Err(Error::Invalid("shared memory needs at least one bank".into()));
        }
        for (name, size) in [
            ("texture", self.tex_cache_l1_line_size),
            ("constant", self.const_cache_l1_line_size),
        ] {
            if !size.is_power_of_two() || size > crate::mem_fetch::MAX_MEMORY_ACCESS_SIZE as u64 {
                return Err(Error::Invalid(format!(
                    "{name} cache line size {size} must be a power of two of at most {}",
                    crate::mem_fetch::MAX_MEMORY_ACCESS_SIZE
                )));
            }
        }
        if self.param_buffer_threshold_low > 100 {
            return Err(Error::Invalid(format!(
                "parameter buffer threshold {}% exceeds 100%",
                self.param_buffer_threshold_low
            )));
        }
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }
}
