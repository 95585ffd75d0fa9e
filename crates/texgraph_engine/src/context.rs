// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared engine state: device, parameter workers, settings.
//!
//! The context is reference counted with `Rc`, which keeps every graph
//! holding it on the thread that created the device. All GPU calls happen
//! there; only parameter resolution is handed to worker threads.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::scheduler::ParamExecutor;
use std::fmt;
use std::rc::Rc;
use texgraph_gpu::GpuDevice;

/// Device, worker pool and settings shared by a graph tree
pub struct EngineContext {
    device: Rc<dyn GpuDevice>,
    executor: ParamExecutor,
    config: EngineConfig,
}

impl EngineContext {
    /// Validate `config` and start its parameter workers
    pub fn new(device: Rc<dyn GpuDevice>, config: EngineConfig) -> Result<Rc<Self>, EngineError> {
        config.validate()?;
        let executor = ParamExecutor::new(config.phase1_workers)?;
        tracing::info!(
            "Engine context ready ({} parameter workers, default {}x{} {:?})",
            config.phase1_workers,
            config.default_width,
            config.default_height,
            config.default_pixel_format
        );
        Ok(Rc::new(Self {
            device,
            executor,
            config,
        }))
    }

    /// Context resolving parameters on the calling thread
    pub fn inline(device: Rc<dyn GpuDevice>, config: EngineConfig) -> Rc<Self> {
        Rc::new(Self {
            device,
            executor: ParamExecutor::inline(),
            config,
        })
    }

    /// GPU device
    pub fn device(&self) -> &dyn GpuDevice {
        self.device.as_ref()
    }

    /// Parameter worker pool
    pub fn executor(&self) -> &ParamExecutor {
        &self.executor
    }

    /// Settings
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("executor", &self.executor)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use texgraph_gpu::SoftwareDevice;

    #[test]
    fn test_rejects_invalid_config() {
        let config = EngineConfig {
            default_width: 0,
            ..EngineConfig::default()
        };
        let result = EngineContext::new(Rc::new(SoftwareDevice::new()), config);
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_worker_count() {
        let config = EngineConfig {
            phase1_workers: 3,
            ..EngineConfig::default()
        };
        let ctx = EngineContext::new(Rc::new(SoftwareDevice::new()), config).unwrap();
        assert_eq!(ctx.executor().workers(), 3);
        assert_eq!(ctx.device().live_textures(), 0);
    }
}
