//! Context configuration.
//!
//! Every knob is explicit and carried by value into [`Context::new`]; there is
//! no global state. Defaults favour compatibility: a high-performance adapter,
//! default device limits and a conservative dispatch ceiling.
//!
//! [`Context::new`]: crate::gpu::Context::new

use std::time::Duration;

use crate::engine::error::DispatchError;


/// Workgroups per dimension accepted by default.
pub const DEFAULT_MAX_GROUPS_PER_DIMENSION: u32 = 65_535;

/// Total workgroups (product of all three dimensions) accepted by default.
pub const DEFAULT_MAX_TOTAL_GROUPS: u64 = 65_535 * 256;

/// Pre-submission ceiling on dispatch sizes.
///
/// Oversized dispatches are a common way to hang or crash a driver, so every
/// dispatch is checked against these limits before it is encoded.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchLimits {
    /// Maximum workgroups along any single dimension.
    pub max_groups_per_dimension: u32,

    /// Maximum product `x * y * z`.
    pub max_total_groups: u64,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            max_groups_per_dimension: DEFAULT_MAX_GROUPS_PER_DIMENSION,
            max_total_groups: DEFAULT_MAX_TOTAL_GROUPS,
        }
    }
}

impl DispatchLimits {
    /// Tightens the per-dimension limit to what the device supports.
    pub fn clamped_to(self, device_max_per_dimension: u32) -> Self {
        Self {
            max_groups_per_dimension: self.max_groups_per_dimension.min(device_max_per_dimension),
            ..self
        }
    }

    /// Validates a dispatch of `x * y * z` workgroups.
    ///
    /// ## Errors
    /// * [`DispatchError::ZeroGroups`] if any count is zero.
    /// * [`DispatchError::DimensionLimit`] if a count exceeds the per-dimension limit.
    /// * [`DispatchError::TotalLimit`] if the product exceeds the total limit.
    pub fn check(&self, x: u32, y: u32, z: u32) -> Result<(), DispatchError> {
        if x == 0 || y == 0 || z == 0 {
            return Err(DispatchError::ZeroGroups { x, y, z });
        }
        for (axis, groups) in [('x', x), ('y', y), ('z', z)] {
            if groups > self.max_groups_per_dimension {
                return Err(DispatchError::DimensionLimit {
                    axis,
                    groups,
                    limit: self.max_groups_per_dimension,
                });
            }
        }
        let total = x as u64 * y as u64 * z as u64;
        if total > self.max_total_groups {
            return Err(DispatchError::TotalLimit { total, limit: self.max_total_groups });
        }
        Ok(())
    }
}

/// Where packed types are converted between host and device layouts.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackingStrategy {
    /// Stage one word per lane and convert with device kernels.
    #[default]
    Device,
    /// Convert on the CPU and transfer packed words directly.
    Host,
}

/// Configuration for a [`Context`](crate::gpu::Context).

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Adapter power preference.
    pub power_preference: wgpu::PowerPreference,

    /// Force a software adapter.
    pub force_fallback_adapter: bool,

    /// Label attached to the device and used as a prefix for object labels.
    pub label: String,

    /// Pre-submission dispatch ceiling.
    pub dispatch_limits: DispatchLimits,

    /// Packing strategy for narrow and wide types.
    pub packing: PackingStrategy,

    /// Upper bound on a blocking device wait during readback.
    pub readback_timeout: Duration,

    /// Largest storage range, in bytes, one conversion kernel binds.
    /// Transfers beyond it are split into several dispatches. Never exceeds
    /// the device's own storage binding limit.
    pub max_conversion_binding: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            label: "minigpu_device".to_owned(),
            dispatch_limits: DispatchLimits::default(),
            packing: PackingStrategy::default(),
            readback_timeout: Duration::from_secs(60),
            max_conversion_binding: u64::MAX,
        }
    }
}

impl ContextConfig {
    /// Sets the adapter power preference.
    pub fn with_power_preference(mut self, preference: wgpu::PowerPreference) -> Self {
        self.power_preference = preference;
        self
    }

    /// Requests a software fallback adapter.
    pub fn with_fallback_adapter(mut self, force: bool) -> Self {
        self.force_fallback_adapter = force;
        self
    }

    /// Sets the device label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Sets the dispatch ceiling.
    pub fn with_dispatch_limits(mut self, limits: DispatchLimits) -> Self {
        self.dispatch_limits = limits;
        self
    }

    /// Sets the packing strategy.
    pub fn with_packing(mut self, packing: PackingStrategy) -> Self {
        self.packing = packing;
        self
    }

    /// Sets the readback wait bound.
    pub fn with_readback_timeout(mut self, timeout: Duration) -> Self {
        self.readback_timeout = timeout;
        self
    }

    /// Caps the storage range a conversion kernel binds at once.
    pub fn with_max_conversion_binding(mut self, bytes: u64) -> Self {
        self.max_conversion_binding = bytes;
        self
    }
}
