//! Generation-stamped resource arena.
//!
//! Buffers and textures live in a [`SlotMap`] keyed by [`ResourceHandle`].
//! A handle carries the slot's generation, so a handle kept past
//! [`ResourceArena::retire`] resolves to `None` instead of to whatever reuses
//! the slot.
//!
//! Each entry remembers the last fence whose submission referenced it.
//! Retiring an entry that the GPU may still read parks it with that fence;
//! [`ResourceArena::reclaim`] destroys parked resources once their fence is
//! signaled.
//!
//! Fences handed to the arena must outlive every entry that refers to them.

use std::sync::Arc;

use ash::vk;
use slotmap::SlotMap;
use tracing::{debug, error};

use crate::buffer::Buffer;
use crate::error::RhiResult;
use crate::gpu::Gpu;
use crate::texture::Texture2D;

slotmap::new_key_type! {
    /// Generation-stamped key of an arena entry.
    pub struct ResourceHandle;
}

/// A resource the arena can own.
pub enum Resource<G: Gpu> {
    Buffer(Buffer<G>),
    Texture(Texture2D<G>),
}

impl<G: Gpu> Resource<G> {
    fn kind(&self) -> &'static str {
        match self {
            Resource::Buffer(b) => b.usage().name(),
            Resource::Texture(_) => "texture",
        }
    }
}

struct Entry<G: Gpu> {
    resource: Resource<G>,
    last_used: Option<vk::Fence>,
}

pub struct ResourceArena<G: Gpu> {
    gpu: Arc<G>,
    live: SlotMap<ResourceHandle, Entry<G>>,
    retired: Vec<(Resource<G>, vk::Fence)>,
}

impl<G: Gpu> ResourceArena<G> {
    pub fn new(gpu: Arc<G>) -> Self {
        Self {
            gpu,
            live: SlotMap::with_key(),
            retired: Vec::new(),
        }
    }

    pub fn insert(&mut self, resource: Resource<G>) -> ResourceHandle {
        self.live.insert(Entry {
            resource,
            last_used: None,
        })
    }

    pub fn insert_buffer(&mut self, buffer: Buffer<G>) -> ResourceHandle {
        self.insert(Resource::Buffer(buffer))
    }

    pub fn insert_texture(&mut self, texture: Texture2D<G>) -> ResourceHandle {
        self.insert(Resource::Texture(texture))
    }

    pub fn get(&self, handle: ResourceHandle) -> Option<&Resource<G>> {
        self.live.get(handle).map(|entry| &entry.resource)
    }

    pub fn buffer(&self, handle: ResourceHandle) -> Option<&Buffer<G>> {
        match self.get(handle)? {
            Resource::Buffer(buffer) => Some(buffer),
            Resource::Texture(_) => None,
        }
    }

    pub fn texture(&self, handle: ResourceHandle) -> Option<&Texture2D<G>> {
        match self.get(handle)? {
            Resource::Texture(texture) => Some(texture),
            Resource::Buffer(_) => None,
        }
    }

    #[inline]
    pub fn contains(&self, handle: ResourceHandle) -> bool {
        self.live.contains_key(handle)
    }

    /// Records that the submission guarded by `fence` references `handle`.
    ///
    /// Returns false for a stale handle.
    pub fn mark_used(&mut self, handle: ResourceHandle, fence: vk::Fence) -> bool {
        match self.live.get_mut(handle) {
            Some(entry) => {
                entry.last_used = Some(fence);
                true
            }
            None => false,
        }
    }

    /// Fence of the last submission recorded against `handle`.
    pub fn last_used(&self, handle: ResourceHandle) -> Option<vk::Fence> {
        self.live.get(handle).and_then(|entry| entry.last_used)
    }

    /// Removes `handle` from the arena.
    ///
    /// A resource no submission was recorded against is destroyed at once.
    /// Otherwise it is parked until its fence signals. Returns false for a
    /// stale handle.
    pub fn retire(&mut self, handle: ResourceHandle) -> bool {
        let Some(entry) = self.live.remove(handle) else {
            return false;
        };
        match entry.last_used {
            Some(fence) => self.retire_with(entry.resource, fence),
            None => debug!("Destroying unused {} immediately", entry.resource.kind()),
        }
        true
    }

    /// Parks a resource that is not tracked by a handle until `fence` signals.
    pub fn retire_with(&mut self, resource: Resource<G>, fence: vk::Fence) {
        debug!("Parked {} behind fence {:?}", resource.kind(), fence);
        self.retired.push((resource, fence));
    }

    /// Destroys every parked resource whose fence is signaled.
    ///
    /// Returns the number of resources destroyed.
    pub fn reclaim(&mut self) -> RhiResult<usize> {
        let before = self.retired.len();
        let mut kept = Vec::with_capacity(before);
        let mut result = Ok(());

        for (resource, fence) in self.retired.drain(..) {
            if result.is_err() {
                kept.push((resource, fence));
                continue;
            }
            match self.gpu.fence_signaled(fence) {
                Ok(true) => drop(resource),
                Ok(false) => kept.push((resource, fence)),
                Err(e) => {
                    kept.push((resource, fence));
                    result = Err(e);
                }
            }
        }

        self.retired = kept;
        result?;

        let reclaimed = before - self.retired.len();
        if reclaimed > 0 {
            debug!("Reclaimed {} resources", reclaimed);
        }
        Ok(reclaimed)
    }

    /// Number of live entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of retired resources still waiting on a fence.
    #[inline]
    pub fn pending(&self) -> usize {
        self.retired.len()
    }
}

impl<G: Gpu> Drop for ResourceArena<G> {
    fn drop(&mut self) {
        if self.live.is_empty() && self.retired.is_empty() {
            return;
        }
        if let Err(e) = self.gpu.wait_idle() {
            error!("Failed to wait for device idle before freeing resources: {}", e);
        }
        self.retired.clear();
        self.live.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferUsage;
    use crate::command::{CommandPool, submit_command_buffer};
    use crate::mock::MockGpu;
    use crate::physical_device::QueueRoles;
    use crate::sync::Fence;

    fn setup() -> (Arc<MockGpu>, ResourceArena<MockGpu>) {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        let arena = ResourceArena::new(gpu.clone());
        (gpu, arena)
    }

    fn staging(gpu: &Arc<MockGpu>) -> Buffer<MockGpu> {
        Buffer::new(gpu.clone(), BufferUsage::Staging, 16).unwrap()
    }

    /// Submits an empty command buffer guarded by `fence`, leaving it pending.
    fn submit_pending(gpu: &Arc<MockGpu>, pool: &CommandPool<MockGpu>, fence: &Fence<MockGpu>) {
        let cb = pool.allocate_command_buffer().unwrap();
        cb.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        submit_command_buffer(
            gpu.as_ref(),
            gpu.graphics_queue(),
            cb.handle(),
            &[],
            &[],
            &[],
            fence.handle(),
        )
        .unwrap();
    }

    #[test]
    fn test_stale_handle_resolves_to_none() {
        let (gpu, mut arena) = setup();
        let first = arena.insert_buffer(staging(&gpu));
        assert!(arena.buffer(first).is_some());
        assert!(arena.texture(first).is_none());

        assert!(arena.retire(first));
        let second = arena.insert_buffer(staging(&gpu));

        assert!(arena.get(first).is_none());
        assert!(!arena.mark_used(first, vk::Fence::null()));
        assert!(!arena.retire(first));
        assert!(arena.buffer(second).is_some());
    }

    #[test]
    fn test_unused_resource_is_freed_on_retire() {
        let (gpu, mut arena) = setup();
        let handle = arena.insert_buffer(staging(&gpu));
        let buffer = arena.buffer(handle).unwrap().handle();

        arena.retire(handle);
        assert!(!gpu.is_live_buffer(buffer));
        assert_eq!(arena.pending(), 0);
    }

    #[test]
    fn test_reclaim_waits_for_fence() {
        let (gpu, mut arena) = setup();
        let pool = CommandPool::new(gpu.clone(), 0).unwrap();
        let fence = Fence::new(gpu.clone(), false).unwrap();

        let handle = arena.insert_buffer(staging(&gpu));
        let buffer = arena.buffer(handle).unwrap().handle();
        submit_pending(&gpu, &pool, &fence);
        arena.mark_used(handle, fence.handle());
        assert_eq!(arena.last_used(handle), Some(fence.handle()));

        arena.retire(handle);
        assert_eq!(arena.pending(), 1);
        assert_eq!(arena.reclaim().unwrap(), 0);
        assert!(gpu.is_live_buffer(buffer));

        fence.wait().unwrap();
        assert_eq!(arena.reclaim().unwrap(), 1);
        assert!(!gpu.is_live_buffer(buffer));
    }

    #[test]
    fn test_retire_with_anonymous_resource() {
        let (gpu, mut arena) = setup();
        let fence = Fence::new(gpu.clone(), true).unwrap();

        arena.retire_with(Resource::Buffer(staging(&gpu)), fence.handle());
        assert_eq!(arena.reclaim().unwrap(), 1);
        assert_eq!(arena.pending(), 0);
    }

    #[test]
    fn test_drop_waits_idle_and_frees_everything() {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        let fence = Fence::new(gpu.clone(), false).unwrap();
        {
            let mut arena = ResourceArena::new(gpu.clone());
            arena.insert_buffer(staging(&gpu));
            arena.retire_with(Resource::Buffer(staging(&gpu)), fence.handle());
        }
        assert_eq!(gpu.wait_idle_calls(), 1);
        // Only the fence remains.
        assert_eq!(gpu.live_objects(), 1);
    }
}
