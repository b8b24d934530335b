//! Sharding configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::precision::{CpuOffload, MixedPrecision};
use crate::prefetch::BackwardPrefetch;
use crate::state_dict::{FullStateDictConfig, StateDictType};
use crate::wrap::WrapPolicyConfig;

/// How parameters, gradients and their reduction are split across ranks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardingStrategy {
    /// Shard parameters and gradients; reshard after forward and after backward.
    #[default]
    FullShard,
    /// Shard parameters and gradients, but keep parameters unsharded from
    /// forward until their backward is done.
    ShardGradOp,
    /// Every rank keeps the whole flat buffer; gradients are all-reduced.
    NoShard,
}

impl ShardingStrategy {
    /// Whether forward releases full parameters as soon as a unit finishes.
    pub fn reshard_after_forward(self) -> bool {
        matches!(self, ShardingStrategy::FullShard)
    }

    pub fn replicates(self) -> bool {
        matches!(self, ShardingStrategy::NoShard)
    }
}

/// Construction-time configuration for a [`ShardedModule`](crate::ShardedModule).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    pub strategy: ShardingStrategy,
    pub mixed_precision: MixedPrecision,
    pub cpu_offload: CpuOffload,
    /// `None` disables backward prefetch
    pub backward_prefetch: Option<BackwardPrefetch>,
    pub forward_prefetch: bool,
    /// How many groups ahead prefetch unshards
    pub prefetch_depth: usize,
    pub state_dict_type: StateDictType,
    pub full_state_dict: FullStateDictConfig,
    /// Reject groups whose parameters disagree on dtype instead of casting
    pub require_uniform_dtype: bool,
    pub collective_timeout_ms: u64,
    /// Broadcast rank 0's initial parameters to every rank at construction
    pub sync_module_states: bool,
    pub wrap: WrapPolicyConfig,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            strategy: ShardingStrategy::FullShard,
            mixed_precision: MixedPrecision::default(),
            cpu_offload: CpuOffload::default(),
            backward_prefetch: Some(BackwardPrefetch::BackwardPre),
            forward_prefetch: false,
            prefetch_depth: 1,
            state_dict_type: StateDictType::Full,
            full_state_dict: FullStateDictConfig::default(),
            require_uniform_dtype: true,
            collective_timeout_ms: 30_000,
            sync_module_states: false,
            wrap: WrapPolicyConfig::default(),
        }
    }
}

impl ShardingConfig {
    /// Parse from JSON, filling unspecified fields with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::Config {
            reason: format!("failed to parse sharding config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Config {
            reason: format!("failed to serialize sharding config: {e}"),
        })
    }

    pub fn with_strategy(mut self, strategy: ShardingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_mixed_precision(mut self, mp: MixedPrecision) -> Self {
        self.mixed_precision = mp;
        self
    }

    pub fn with_cpu_offload(mut self, offload_params: bool) -> Self {
        self.cpu_offload = CpuOffload { offload_params };
        self
    }

    pub fn with_backward_prefetch(mut self, mode: Option<BackwardPrefetch>) -> Self {
        self.backward_prefetch = mode;
        self
    }

    pub fn with_forward_prefetch(mut self, enabled: bool) -> Self {
        self.forward_prefetch = enabled;
        self
    }

    pub fn with_prefetch_depth(mut self, depth: usize) -> Self {
        self.prefetch_depth = depth;
        self
    }

    pub fn with_state_dict_type(mut self, kind: StateDictType) -> Self {
        self.state_dict_type = kind;
        self
    }

    pub fn with_full_state_dict_config(mut self, cfg: FullStateDictConfig) -> Self {
        self.full_state_dict = cfg;
        self
    }

    pub fn with_require_uniform_dtype(mut self, required: bool) -> Self {
        self.require_uniform_dtype = required;
        self
    }

    pub fn with_collective_timeout(mut self, timeout: Duration) -> Self {
        self.collective_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_sync_module_states(mut self, sync: bool) -> Self {
        self.sync_module_states = sync;
        self
    }

    pub fn with_wrap(mut self, wrap: WrapPolicyConfig) -> Self {
        self.wrap = wrap;
        self
    }

    pub fn collective_timeout(&self) -> Duration {
        Duration::from_millis(self.collective_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.mixed_precision.validate()?;
        if self.prefetch_depth == 0 {
            return Err(Error::Config {
                reason: "prefetch_depth must be at least 1".into(),
            });
        }
        if self.collective_timeout_ms == 0 {
            return Err(Error::Config {
                reason: "collective_timeout_ms must be positive".into(),
            });
        }
        match &self.wrap {
            WrapPolicyConfig::SizeBased { min_num_params: 0 } => Err(Error::Config {
                reason: "size-based wrap needs min_num_params > 0".into(),
            }),
            WrapPolicyConfig::ModuleTypes { types } if types.is_empty() => Err(Error::Config {
                reason: "module-type wrap needs at least one type".into(),
            }),
            _ => Ok(()),
        }
    }
}
