//! Resource utilization, derived on demand from the tenant usage ledger
//! joined against quota capacity.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::repo::TaskRepository;

/// Rolling window the usage ledger is summed over.
pub const UTILIZATION_WINDOW: Duration = Duration::from_secs(300);

/// Capacity fallbacks when no tenant quotas are registered.
pub const FALLBACK_CPU_CORES: f64 = 8.0;
pub const FALLBACK_MEMORY_GB: f64 = 32.0;
pub const FALLBACK_GPUS: f64 = 2.0;

/// The resource axes preemption rules can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Gpu,
    Budget,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Gpu => "gpu",
            Self::Budget => "budget",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resource axis: absolute use, capacity, and the derived percentage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub used: f64,
    pub total: f64,
    pub percent: f64,
}

impl ResourceUsage {
    fn derive(used: f64, total: f64) -> Self {
        let percent = if total > 0.0 { used / total * 100.0 } else { 0.0 };
        Self { used, total, percent }
    }
}

/// Snapshot of all resource axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUtilization {
    pub cpu: ResourceUsage,
    pub memory: ResourceUsage,
    pub gpu: ResourceUsage,
    /// Spend against registered budget quotas; zero when no quota exists.
    pub budget: ResourceUsage,
}

impl ResourceUtilization {
    pub fn percent_of(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu.percent,
            ResourceKind::Memory => self.memory.percent,
            ResourceKind::Gpu => self.gpu.percent,
            ResourceKind::Budget => self.budget.percent,
        }
    }
}

/// Compute utilization from the trailing usage window and quota capacity.
pub fn compute_utilization(repo: &TaskRepository) -> Result<ResourceUtilization, EngineError> {
    let axis = |kind: ResourceKind, fallback: Option<f64>| -> Result<ResourceUsage, EngineError> {
        let used = repo
            .usage_in_window(kind.as_str(), UTILIZATION_WINDOW)
            .map_err(EngineError::Database)?;
        let total = repo
            .quota_total(kind.as_str())
            .map_err(EngineError::Database)?
            .or(fallback)
            .unwrap_or(0.0);
        Ok(ResourceUsage::derive(used, total))
    };
    Ok(ResourceUtilization {
        cpu: axis(ResourceKind::Cpu, Some(FALLBACK_CPU_CORES))?,
        memory: axis(ResourceKind::Memory, Some(FALLBACK_MEMORY_GB))?,
        gpu: axis(ResourceKind::Gpu, Some(FALLBACK_GPUS))?,
        budget: axis(ResourceKind::Budget, None)?,
    })
}
