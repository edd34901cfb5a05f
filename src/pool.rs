//! Offscreen render-target allocation with frame-to-frame reuse.
//!
//! Targets are keyed by a stable name that doubles as the debug label of
//! the GPU texture. An allocation is only replaced when the requested
//! width, height or format differ from what is currently held, so stable
//! frames cost no GPU memory churn.

use std::borrow::Cow;

use bevy::{
    platform::collections::{hash_map::Entry, HashMap},
    prelude::*,
    render::{
        render_resource::{
            AddressMode, Extent3d, FilterMode, Texture, TextureDescriptor, TextureDimension,
            TextureFormat, TextureUsages, TextureView, TextureViewDescriptor,
        },
        renderer::RenderDevice,
    },
};

pub const MASK_TARGET: &str = "outline_mask";
pub const BLUR_PING_TARGET: &str = "outline_blur_ping";
pub const BLUR_PONG_TARGET: &str = "outline_blur_pong";
pub const EDGE_TARGET: &str = "outline_edge";
pub const SCENE_COPY_TARGET: &str = "outline_scene_copy";

/// Pixel format of the mask, ping-pong and edge targets. Float so that
/// HDR outline colors survive the blur chain.
pub const INTERMEDIATE_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

/// Describes one pooled render target.
///
/// The name identifies the allocation inside the pool and names the
/// texture for graphics debuggers; the same string is what shader-side
/// bindings of the target are documented against.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetDescriptor {
    pub name: Cow<'static, str>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub filter: FilterMode,
    pub address_mode: AddressMode,
}

impl TargetDescriptor {
    /// Bilinear/clamp color target, the configuration every pass of the
    /// outline pipeline uses.
    pub fn color(name: &'static str, size: UVec2, format: TextureFormat) -> Self {
        Self {
            name: Cow::Borrowed(name),
            width: size.x,
            height: size.y,
            format,
            filter: FilterMode::Linear,
            address_mode: AddressMode::ClampToEdge,
        }
    }

    /// Whether an allocation made for `held` still satisfies `self`.
    /// Filter and address mode live in the sampler, not the texture, so
    /// they never force a reallocation.
    fn satisfied_by(&self, held: &TargetDescriptor) -> bool {
        self.width == held.width && self.height == held.height && self.format == held.format
    }
}

/// Mask resolution for a camera target size and downsample exponent.
/// `None` when the downsampled size collapses to zero; the requesting
/// pass must skip instead of allocating.
pub fn downsampled_resolution(full: UVec2, downsample: u32) -> Option<UVec2> {
    let size = UVec2::new(full.x >> downsample, full.y >> downsample);
    (size.x > 0 && size.y > 0).then_some(size)
}

struct PoolEntry<T> {
    descriptor: TargetDescriptor,
    resource: T,
}

/// Name-keyed pool of render targets, generic over the backing resource
/// so the reuse policy is testable without a GPU device.
pub struct RenderTargetPool<T> {
    entries: HashMap<Cow<'static, str>, PoolEntry<T>>,
}

impl<T> Default for RenderTargetPool<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::default(),
        }
    }
}

impl<T> RenderTargetPool<T> {
    /// Returns the target for `descriptor.name`, allocating through
    /// `alloc` only when no held allocation satisfies the descriptor.
    /// A replaced allocation is dropped, releasing its GPU memory.
    pub fn ensure(
        &mut self,
        descriptor: TargetDescriptor,
        alloc: impl FnOnce(&TargetDescriptor) -> T,
    ) -> &T {
        debug_assert!(
            descriptor.width > 0 && descriptor.height > 0,
            "degenerate target size for {:?}",
            descriptor.name
        );

        match self.entries.entry(descriptor.name.clone()) {
            Entry::Occupied(mut occupied) => {
                if !descriptor.satisfied_by(&occupied.get().descriptor) {
                    let resource = alloc(&descriptor);
                    *occupied.get_mut() = PoolEntry {
                        descriptor,
                        resource,
                    };
                }
                &occupied.into_mut().resource
            }
            Entry::Vacant(vacant) => {
                let resource = alloc(&descriptor);
                &vacant
                    .insert(PoolEntry {
                        descriptor,
                        resource,
                    })
                    .resource
            }
        }
    }

    /// Drops every held allocation. Called at pipeline-instance
    /// teardown; allocations are deliberately not released per frame.
    pub fn release_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A pooled GPU color target.
#[derive(Clone)]
pub struct GpuRenderTarget {
    pub texture: Texture,
    pub view: TextureView,
}

/// Per-view pool of the outline pipeline's GPU targets. Lives on the
/// camera's render-world entity and is dropped with it, which releases
/// every held texture.
#[derive(Component, Default)]
pub struct OutlineTargetPool {
    pool: RenderTargetPool<GpuRenderTarget>,
}

impl OutlineTargetPool {
    /// Allocates or reuses a sampleable color attachment per the
    /// descriptor.
    pub fn ensure(
        &mut self,
        render_device: &RenderDevice,
        descriptor: TargetDescriptor,
    ) -> GpuRenderTarget {
        self.pool
            .ensure(descriptor, |descriptor| {
                let texture = render_device.create_texture(&TextureDescriptor {
                    label: Some(descriptor.name.as_ref()),
                    size: Extent3d {
                        width: descriptor.width,
                        height: descriptor.height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: TextureDimension::D2,
                    format: descriptor.format,
                    usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::TEXTURE_BINDING,
                    view_formats: &[],
                });
                let view = texture.create_view(&TextureViewDescriptor::default());
                GpuRenderTarget { texture, view }
            })
            .clone()
    }

    pub fn release_all(&mut self) {
        self.pool.release_all();
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(size: UVec2) -> TargetDescriptor {
        TargetDescriptor::color(MASK_TARGET, size, INTERMEDIATE_FORMAT)
    }

    #[test]
    fn unchanged_descriptor_reuses_allocation() {
        let mut pool = RenderTargetPool::<u32>::default();
        let mut allocations = 0;

        for _ in 0..3 {
            let id = *pool.ensure(descriptor(UVec2::new(640, 480)), |_| {
                allocations += 1;
                allocations
            });
            assert_eq!(id, 1);
        }
        assert_eq!(allocations, 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn resize_reallocates() {
        let mut pool = RenderTargetPool::<u32>::default();
        let mut allocations = 0;
        let mut alloc = |_: &TargetDescriptor| {
            allocations += 1;
            allocations
        };

        let first = *pool.ensure(descriptor(UVec2::new(640, 480)), &mut alloc);
        let second = *pool.ensure(descriptor(UVec2::new(320, 240)), &mut alloc);
        assert_ne!(first, second);
        assert_eq!(allocations, 2);
        // Still one target per name, the old allocation was dropped.
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn format_change_reallocates() {
        let mut pool = RenderTargetPool::<u32>::default();
        let mut allocations = 0;
        let mut alloc = |_: &TargetDescriptor| {
            allocations += 1;
            allocations
        };

        pool.ensure(descriptor(UVec2::new(64, 64)), &mut alloc);
        let mut changed = descriptor(UVec2::new(64, 64));
        changed.format = TextureFormat::Rgba8UnormSrgb;
        pool.ensure(changed, &mut alloc);
        assert_eq!(allocations, 2);
    }

    #[test]
    fn filter_change_does_not_reallocate() {
        let mut pool = RenderTargetPool::<u32>::default();
        let mut allocations = 0;
        let mut alloc = |_: &TargetDescriptor| {
            allocations += 1;
            allocations
        };

        pool.ensure(descriptor(UVec2::new(64, 64)), &mut alloc);
        let mut changed = descriptor(UVec2::new(64, 64));
        changed.filter = FilterMode::Nearest;
        pool.ensure(changed, &mut alloc);
        assert_eq!(allocations, 1);
    }

    #[test]
    fn distinct_names_hold_distinct_targets() {
        let mut pool = RenderTargetPool::<&'static str>::default();
        pool.ensure(
            TargetDescriptor::color(BLUR_PING_TARGET, UVec2::new(64, 64), INTERMEDIATE_FORMAT),
            |d| if d.name == BLUR_PING_TARGET { "ping" } else { "?" },
        );
        pool.ensure(
            TargetDescriptor::color(BLUR_PONG_TARGET, UVec2::new(64, 64), INTERMEDIATE_FORMAT),
            |d| if d.name == BLUR_PONG_TARGET { "pong" } else { "?" },
        );
        assert_eq!(pool.len(), 2);

        pool.release_all();
        assert!(pool.is_empty());
    }

    #[test]
    fn downsampled_resolution_halves_and_rejects_degenerate() {
        assert_eq!(
            downsampled_resolution(UVec2::new(1920, 1080), 0),
            Some(UVec2::new(1920, 1080))
        );
        assert_eq!(
            downsampled_resolution(UVec2::new(1920, 1080), 1),
            Some(UVec2::new(960, 540))
        );
        assert_eq!(
            downsampled_resolution(UVec2::new(1920, 1080), 2),
            Some(UVec2::new(480, 270))
        );
        assert_eq!(downsampled_resolution(UVec2::new(1, 1), 1), None);
        assert_eq!(downsampled_resolution(UVec2::ZERO, 0), None);
    }
}
