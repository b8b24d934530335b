//! Precision and offload policy.
//!
//! Pure configuration read by the flattening layer and the unshard/reshard
//! controller. Offloading adds two staging copies (host to accelerator on
//! unshard, drop of the staged copy on reshard) without adding states.

use numr::dtype::DType;
use serde::{Deserialize, Serialize};

use crate::tensor::{dtype_serde, is_supported};
use crate::error::{Error, Result};
use crate::store::Residency;

/// Dtypes for the three places a flat parameter's data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixedPrecision {
    /// Dtype sharded flat buffers persist in (master weights)
    #[serde(with = "dtype_serde")]
    pub storage_dtype: DType,
    /// Dtype parameters are cast to for forward/backward compute
    #[serde(with = "dtype_serde")]
    pub param_dtype: DType,
    /// Dtype gradient reduce-scatter accumulates in
    #[serde(with = "dtype_serde")]
    pub reduce_dtype: DType,
}

impl Default for MixedPrecision {
    fn default() -> Self {
        Self {
            storage_dtype: DType::F32,
            param_dtype: DType::F32,
            reduce_dtype: DType::F32,
        }
    }
}

impl MixedPrecision {
    /// F32 master weights, BF16 compute and reduction.
    pub fn bf16() -> Self {
        Self {
            storage_dtype: DType::F32,
            param_dtype: DType::BF16,
            reduce_dtype: DType::BF16,
        }
    }

    /// F32 master weights, F16 compute, F32 reduction.
    ///
    /// F16's narrow exponent range makes summing across many ranks risky,
    /// so gradients are reduced at full precision.
    pub fn fp16() -> Self {
        Self {
            storage_dtype: DType::F32,
            param_dtype: DType::F16,
            reduce_dtype: DType::F32,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (field, dtype) in [
            ("storage_dtype", self.storage_dtype),
            ("param_dtype", self.param_dtype),
            ("reduce_dtype", self.reduce_dtype),
        ] {
            if !is_supported(dtype) {
                return Err(Error::Config {
                    reason: format!("{field} {dtype} is not a floating dtype"),
                });
            }
        }
        Ok(())
    }

    /// Whether unsharding needs a cast from storage to compute dtype.
    pub fn casts_for_compute(&self) -> bool {
        self.param_dtype != self.storage_dtype
    }
}

/// Host offload of idle shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuOffload {
    pub offload_params: bool,
}

impl CpuOffload {
    /// Where sharded flat buffers rest between uses.
    pub fn shard_residency(&self) -> Residency {
        if self.offload_params {
            Residency::Host
        } else {
            Residency::Accelerator
        }
    }
}
