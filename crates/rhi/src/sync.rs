//! Synchronization primitives.
//!
//! - [`Semaphore`] orders work between queue operations. The host never waits
//!   on it.
//! - [`Fence`] is the only primitive the host can observe. It gates reuse of
//!   anything a submission may still be reading or writing.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use presenter_rhi::device::Device;
//! use presenter_rhi::sync::{Fence, Semaphore};
//!
//! # fn example(device: Arc<Device>) -> Result<(), presenter_rhi::RhiError> {
//! let image_ready = Semaphore::new(device.clone())?;
//!
//! // Starts signaled so the first wait returns immediately.
//! let buffer_finished = Fence::new(device, true)?;
//!
//! buffer_finished.wait()?;
//! buffer_finished.reset()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::error::RhiResult;
use crate::gpu::Gpu;

/// Semaphore wrapper.
///
/// Created unsignaled. Destroyed on drop.
pub struct Semaphore<G: Gpu> {
    gpu: Arc<G>,
    semaphore: vk::Semaphore,
}

impl<G: Gpu> Semaphore<G> {
    /// Creates a new unsignaled semaphore.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(gpu: Arc<G>) -> RhiResult<Self> {
        let semaphore = gpu.create_semaphore()?;
        debug!("Created semaphore {:?}", semaphore);
        Ok(Self { gpu, semaphore })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl<G: Gpu> Drop for Semaphore<G> {
    fn drop(&mut self) {
        self.gpu.destroy_semaphore(self.semaphore);
        debug!("Destroyed semaphore {:?}", self.semaphore);
    }
}

/// Fence wrapper.
///
/// Waits are unbounded. A hung device hangs the caller.
pub struct Fence<G: Gpu> {
    gpu: Arc<G>,
    fence: vk::Fence,
}

impl<G: Gpu> Fence<G> {
    /// Creates a new fence.
    ///
    /// # Arguments
    ///
    /// * `gpu` - The device
    /// * `signaled` - If true, the first [`wait`](Self::wait) returns without
    ///   any submission having signaled it.
    ///
    /// # Errors
    ///
    /// Returns an error if fence creation fails.
    pub fn new(gpu: Arc<G>, signaled: bool) -> RhiResult<Self> {
        let fence = gpu.create_fence(signaled)?;

        debug!(
            "Created fence {:?} ({})",
            fence,
            if signaled { "signaled" } else { "unsignaled" }
        );

        Ok(Self { gpu, fence })
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Blocks until the fence is signaled.
    pub fn wait(&self) -> RhiResult<()> {
        self.gpu.wait_for_fences(&[self.fence], u64::MAX)
    }

    /// Resets the fence to the unsignaled state.
    ///
    /// The fence must not be attached to a pending submission.
    pub fn reset(&self) -> RhiResult<()> {
        self.gpu.reset_fences(&[self.fence])
    }

    /// Non-blocking status query.
    pub fn is_signaled(&self) -> RhiResult<bool> {
        self.gpu.fence_signaled(self.fence)
    }
}

impl<G: Gpu> Drop for Fence<G> {
    fn drop(&mut self) {
        self.gpu.destroy_fence(self.fence);
        debug!("Destroyed fence {:?}", self.fence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::mock::MockGpu;
    use crate::physical_device::QueueRoles;

    #[test]
    fn test_sync_objects_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Semaphore<Device>>();
        assert_send_sync::<Fence<Device>>();
    }

    #[test]
    fn test_signaled_fence_wait_returns() {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        let fence = Fence::new(gpu.clone(), true).unwrap();

        fence.wait().unwrap();
        fence.reset().unwrap();
        assert!(!fence.is_signaled().unwrap());
        assert_eq!(gpu.fence_waits(fence.handle()), 1);
    }

    #[test]
    fn test_drop_destroys_handles() {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        {
            let _fence = Fence::new(gpu.clone(), false).unwrap();
            let _semaphore = Semaphore::new(gpu.clone()).unwrap();
            assert_eq!(gpu.live_objects(), 2);
        }
        assert_eq!(gpu.live_objects(), 0);
        assert!(gpu.violations().is_empty());
    }
}
