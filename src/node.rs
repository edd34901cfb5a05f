//! The outline render node and its per-frame GPU preparation.
//!
//! The node runs once per view between tonemapping and the end of
//! post-processing. For the blur algorithm it records, in order: a copy of
//! the pristine scene color, the mask-extraction pass, the separable
//! blur ping-pong chain, the edge-isolation pass and the final combine
//! into the camera's post-process destination. The convolution
//! algorithm records the mask pass and a single fullscreen pass.

use bevy::{
    ecs::query::QueryItem,
    prelude::*,
    render::{
        mesh::{allocator::MeshAllocator, RenderMesh, RenderMeshBufferInfo},
        render_asset::RenderAssets,
        render_graph::{NodeRunError, RenderGraphContext, RenderLabel, ViewNode},
        render_resource::{
            BindGroup, BindGroupEntries, Operations, PipelineCache, RenderPassColorAttachment,
            RenderPassDescriptor, StoreOp, TextureFormat,
        },
        renderer::{RenderContext, RenderDevice},
        view::{ExtractedView, ViewTarget, ViewUniformOffset},
    },
};

use crate::{
    components::OutlineAlgorithm,
    pipeline::{OutlineParamBuffers, OutlinePipelines},
    pool::{
        downsampled_resolution, GpuRenderTarget, OutlineTargetPool, TargetDescriptor,
        BLUR_PING_TARGET, BLUR_PONG_TARGET, EDGE_TARGET, INTERMEDIATE_FORMAT, MASK_TARGET,
        SCENE_COPY_TARGET,
    },
    silhouette::{ExtractedOutline, MaskDrawBuffer, SilhouettePipeline, SilhouetteViewBindGroup},
};

#[derive(Debug, Hash, PartialEq, Eq, Clone, RenderLabel)]
pub struct OutlineNodeLabel;

/// Offscreen targets of the blur algorithm, all pooled per view.
pub struct BlurTargets {
    pub ping: GpuRenderTarget,
    pub pong: GpuRenderTarget,
    pub edge: GpuRenderTarget,
    pub scene_copy: GpuRenderTarget,
}

/// Per-view GPU targets for the frame. The mask target is shared by
/// both algorithms; the blur chain only exists in blur mode.
#[derive(Component)]
pub struct OutlineTextures {
    pub mask: GpuRenderTarget,
    pub mask_size: UVec2,
    pub blur: Option<BlurTargets>,
}

/// Allocates (or reuses) the frame's render targets for each view with
/// an extracted outline. A degenerate downsampled resolution skips the
/// view entirely for this frame.
pub fn prepare_outline_textures(
    mut commands: Commands,
    render_device: Res<RenderDevice>,
    mut views: Query<(
        Entity,
        &ExtractedView,
        &ViewTarget,
        &ExtractedOutline,
        Option<&mut OutlineTargetPool>,
    )>,
) {
    for (entity, view, view_target, extracted, pool) in &mut views {
        let full_size = UVec2::new(view.viewport.z, view.viewport.w);
        let Some(mask_size) = downsampled_resolution(full_size, extracted.downsample) else {
            commands.entity(entity).remove::<OutlineTextures>();
            continue;
        };

        let view_format = view_target.main_texture_format();
        match pool {
            Some(mut pool) => {
                let textures =
                    allocate_textures(&mut pool, &render_device, extracted, mask_size, full_size, view_format);
                commands.entity(entity).insert(textures);
            }
            None => {
                let mut pool = OutlineTargetPool::default();
                let textures =
                    allocate_textures(&mut pool, &render_device, extracted, mask_size, full_size, view_format);
                commands.entity(entity).insert((pool, textures));
            }
        }
    }
}

fn allocate_textures(
    pool: &mut OutlineTargetPool,
    render_device: &RenderDevice,
    extracted: &ExtractedOutline,
    mask_size: UVec2,
    full_size: UVec2,
    view_format: TextureFormat,
) -> OutlineTextures {
    let mask = pool.ensure(
        render_device,
        TargetDescriptor::color(MASK_TARGET, mask_size, INTERMEDIATE_FORMAT),
    );

    let blur = match extracted.algorithm {
        OutlineAlgorithm::Convolution => None,
        OutlineAlgorithm::Blur => Some(BlurTargets {
            ping: pool.ensure(
                render_device,
                TargetDescriptor::color(BLUR_PING_TARGET, mask_size, INTERMEDIATE_FORMAT),
            ),
            pong: pool.ensure(
                render_device,
                TargetDescriptor::color(BLUR_PONG_TARGET, mask_size, INTERMEDIATE_FORMAT),
            ),
            edge: pool.ensure(
                render_device,
                TargetDescriptor::color(EDGE_TARGET, mask_size, INTERMEDIATE_FORMAT),
            ),
            // The scene copy stays at native resolution and in the
            // view's own format, unlike the downsampled mask chain.
            scene_copy: pool.ensure(
                render_device,
                TargetDescriptor::color(SCENE_COPY_TARGET, full_size, view_format),
            ),
        }),
    };

    OutlineTextures {
        mask,
        mask_size,
        blur,
    }
}

/// Bind groups of the blur chain. Each directional blur step samples a
/// fixed source, so three source/direction combinations cover the whole
/// schedule.
pub struct BlurBindGroups {
    pub mask_horizontal: BindGroup,
    pub ping_vertical: BindGroup,
    pub pong_horizontal: BindGroup,
    pub edge: BindGroup,
    pub combine: BindGroup,
}

/// Per-view bind groups rebuilt every frame. `surfaces` binds the
/// dynamic per-draw uniform buffer of the mask pass; `blur` is absent
/// in convolution mode.
#[derive(Component)]
pub struct OutlineBindGroups {
    pub surfaces: BindGroup,
    pub blur: Option<BlurBindGroups>,
}

pub fn prepare_outline_bind_groups(
    mut commands: Commands,
    render_device: Res<RenderDevice>,
    pipelines: Res<OutlinePipelines>,
    silhouette_pipeline: Res<SilhouettePipeline>,
    views: Query<(
        Entity,
        &OutlineTextures,
        &MaskDrawBuffer,
        &OutlineParamBuffers,
    )>,
) {
    for (entity, textures, draws, params) in &views {
        // Absent until the first surface uniform was written; without
        // it there is nothing to draw into the mask this frame.
        let Some(surface_binding) = draws.uniforms.binding() else {
            commands.entity(entity).remove::<OutlineBindGroups>();
            continue;
        };
        let surfaces = render_device.create_bind_group(
            "outline_surface_bind_group",
            &silhouette_pipeline.surface_layout,
            &BindGroupEntries::single(surface_binding),
        );

        let blur = textures.blur.as_ref().map(|blur| BlurBindGroups {
            mask_horizontal: render_device.create_bind_group(
                "outline_blur_mask_h_bind_group",
                &pipelines.blur_layout,
                &BindGroupEntries::sequential((
                    &textures.mask.view,
                    &pipelines.sampler,
                    params.blur_horizontal.as_entire_binding(),
                )),
            ),
            ping_vertical: render_device.create_bind_group(
                "outline_blur_ping_v_bind_group",
                &pipelines.blur_layout,
                &BindGroupEntries::sequential((
                    &blur.ping.view,
                    &pipelines.sampler,
                    params.blur_vertical.as_entire_binding(),
                )),
            ),
            pong_horizontal: render_device.create_bind_group(
                "outline_blur_pong_h_bind_group",
                &pipelines.blur_layout,
                &BindGroupEntries::sequential((
                    &blur.pong.view,
                    &pipelines.sampler,
                    params.blur_horizontal.as_entire_binding(),
                )),
            ),
            // Edge isolation blurs the pong buffer one last time
            // (vertically) and subtracts the sharp mask.
            edge: render_device.create_bind_group(
                "outline_edge_bind_group",
                &pipelines.edge_layout,
                &BindGroupEntries::sequential((
                    &blur.pong.view,
                    &textures.mask.view,
                    &pipelines.sampler,
                    params.blur_vertical.as_entire_binding(),
                )),
            ),
            combine: render_device.create_bind_group(
                "outline_combine_bind_group",
                &pipelines.combine_layout,
                &BindGroupEntries::sequential((
                    &blur.scene_copy.view,
                    &blur.edge.view,
                    &pipelines.sampler,
                    params.combine.as_entire_binding(),
                )),
            ),
        });

        commands
            .entity(entity)
            .insert(OutlineBindGroups { surfaces, blur });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlurBuffer {
    Mask,
    Ping,
    Pong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlurStep {
    pub src: BlurBuffer,
    pub dst: BlurBuffer,
    pub horizontal: bool,
}

/// The directional blur sequence for an iteration count: one
/// horizontal/vertical pair off the mask, then one pair per iteration
/// bouncing between ping and pong. The final result always lands in
/// pong, which is what the edge pass samples.
pub(crate) fn blur_schedule(iterations: u32) -> Vec<BlurStep> {
    let mut steps = vec![
        BlurStep {
            src: BlurBuffer::Mask,
            dst: BlurBuffer::Ping,
            horizontal: true,
        },
        BlurStep {
            src: BlurBuffer::Ping,
            dst: BlurBuffer::Pong,
            horizontal: false,
        },
    ];
    for _ in 0..iterations {
        steps.push(BlurStep {
            src: BlurBuffer::Pong,
            dst: BlurBuffer::Ping,
            horizontal: true,
        });
        steps.push(BlurStep {
            src: BlurBuffer::Ping,
            dst: BlurBuffer::Pong,
            horizontal: false,
        });
    }
    steps
}

#[derive(Default)]
pub struct OutlineNode;

impl ViewNode for OutlineNode {
    type ViewQuery = (
        &'static ViewTarget,
        &'static ViewUniformOffset,
        Option<&'static ExtractedOutline>,
        Option<&'static OutlineTextures>,
        Option<&'static MaskDrawBuffer>,
        Option<&'static SilhouetteViewBindGroup>,
        Option<&'static OutlineParamBuffers>,
        Option<&'static OutlineBindGroups>,
    );

    fn run<'w>(
        &self,
        _graph: &mut RenderGraphContext,
        render_context: &mut RenderContext<'w>,
        (view_target, view_offset, extracted, textures, draws, view_bind_group, params, bind_groups): QueryItem<'w, '_, Self::ViewQuery>,
        world: &'w World,
    ) -> Result<(), NodeRunError> {
        let Some(extracted) = extracted else {
            return Ok(());
        };
        let (Some(textures), Some(draws), Some(view_bind_group), Some(params), Some(bind_groups)) =
            (textures, draws, view_bind_group, params, bind_groups)
        else {
            // Not prepared this frame, leave the scene untouched.
            return Ok(());
        };
        if draws.draws.is_empty() {
            return Ok(());
        }

        let pipelines = world.resource::<OutlinePipelines>();
        let pipeline_cache = world.resource::<PipelineCache>();
        let meshes = world.resource::<RenderAssets<RenderMesh>>();
        let mesh_allocator = world.resource::<MeshAllocator>();

        match extracted.algorithm {
            OutlineAlgorithm::Blur => run_blur(
                render_context,
                view_target,
                view_offset,
                extracted,
                textures,
                draws,
                view_bind_group,
                bind_groups,
                pipelines,
                pipeline_cache,
                meshes,
                mesh_allocator,
            ),
            OutlineAlgorithm::Convolution => run_convolution(
                render_context,
                view_target,
                view_offset,
                textures,
                draws,
                view_bind_group,
                bind_groups,
                params,
                pipelines,
                pipeline_cache,
                meshes,
                mesh_allocator,
            ),
        }

        Ok(())
    }
}

fn color_attachment(view: &bevy::render::render_resource::TextureView) -> RenderPassColorAttachment {
    RenderPassColorAttachment {
        view,
        resolve_target: None,
        ops: Operations::default(),
        depth_slice: None,
    }
}

fn clear_attachment(view: &bevy::render::render_resource::TextureView) -> RenderPassColorAttachment {
    RenderPassColorAttachment {
        view,
        resolve_target: None,
        ops: Operations {
            load: bevy::render::render_resource::LoadOp::Clear(Default::default()),
            store: StoreOp::Store,
        },
        depth_slice: None,
    }
}

/// Records one draw per surface into the cleared mask target.
fn record_mask_pass(
    render_context: &mut RenderContext,
    textures: &OutlineTextures,
    draws: &MaskDrawBuffer,
    view_bind_group: &SilhouetteViewBindGroup,
    view_offset: &ViewUniformOffset,
    bind_groups: &OutlineBindGroups,
    pipeline_cache: &PipelineCache,
    meshes: &RenderAssets<RenderMesh>,
    mesh_allocator: &MeshAllocator,
) {
    let mut pass = render_context.begin_tracked_render_pass(RenderPassDescriptor {
        label: Some("outline_mask_pass"),
        color_attachments: &[Some(clear_attachment(&textures.mask.view))],
        depth_stencil_attachment: None,
        timestamp_writes: None,
        occlusion_query_set: None,
    });

    for draw in &draws.draws {
        let Some(pipeline) = pipeline_cache.get_render_pipeline(draw.pipeline) else {
            continue;
        };
        let Some(mesh) = meshes.get(draw.mesh) else {
            continue;
        };
        let Some(vertex_slice) = mesh_allocator.mesh_vertex_slice(&draw.mesh) else {
            continue;
        };

        pass.set_render_pipeline(pipeline);
        pass.set_bind_group(0, &view_bind_group.0, &[view_offset.offset]);
        pass.set_bind_group(1, &bind_groups.surfaces, &[draw.uniform_offset]);
        pass.set_vertex_buffer(0, vertex_slice.buffer.slice(..));

        match &mesh.buffer_info {
            RenderMeshBufferInfo::Indexed {
                index_format,
                count,
            } => {
                let Some(index_slice) = mesh_allocator.mesh_index_slice(&draw.mesh) else {
                    continue;
                };
                pass.set_index_buffer(index_slice.buffer.slice(..), *index_format);
                pass.draw_indexed(
                    index_slice.range.start..index_slice.range.start + count,
                    vertex_slice.range.start as i32,
                    0..1,
                );
            }
            RenderMeshBufferInfo::NonIndexed => {
                pass.draw(vertex_slice.range.clone(), 0..1);
            }
        }
    }
}

fn run_blur(
    render_context: &mut RenderContext,
    view_target: &ViewTarget,
    view_offset: &ViewUniformOffset,
    extracted: &ExtractedOutline,
    textures: &OutlineTextures,
    draws: &MaskDrawBuffer,
    view_bind_group: &SilhouetteViewBindGroup,
    bind_groups: &OutlineBindGroups,
    pipelines: &OutlinePipelines,
    pipeline_cache: &PipelineCache,
    meshes: &RenderAssets<RenderMesh>,
    mesh_allocator: &MeshAllocator,
) {
    let (Some(blur_targets), Some(blur_bind_groups)) = (&textures.blur, &bind_groups.blur) else {
        return;
    };

    let (combine_id, blit_id) = if view_target.is_hdr() {
        (pipelines.combine_pipeline_hdr, pipelines.blit_pipeline_hdr)
    } else {
        (pipelines.combine_pipeline, pipelines.blit_pipeline)
    };
    let (
        Some(blur_pipeline),
        Some(edge_pipeline),
        Some(combine_pipeline),
        Some(blit_pipeline),
    ) = (
        pipeline_cache.get_render_pipeline(pipelines.blur_pipeline),
        pipeline_cache.get_render_pipeline(pipelines.edge_pipeline),
        pipeline_cache.get_render_pipeline(combine_id),
        pipeline_cache.get_render_pipeline(blit_id),
    )
    else {
        return;
    };

    let post_process = view_target.post_process_write();

    // Copy the pristine scene color first; the combine pass reads it
    // back while writing the post-process destination.
    // Note: this bind group must be created each frame because
    // post_process.source changes.
    {
        let blit_bind_group = render_context.render_device().create_bind_group(
            "outline_copy_color_bind_group",
            &pipelines.blit_layout,
            &BindGroupEntries::sequential((post_process.source, &pipelines.sampler)),
        );
        let mut pass = render_context.begin_tracked_render_pass(RenderPassDescriptor {
            label: Some("outline_copy_color_pass"),
            color_attachments: &[Some(color_attachment(&blur_targets.scene_copy.view))],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_render_pipeline(blit_pipeline);
        pass.set_bind_group(0, &blit_bind_group, &[]);
        pass.draw(0..3, 0..1);
    }

    record_mask_pass(
        render_context,
        textures,
        draws,
        view_bind_group,
        view_offset,
        bind_groups,
        pipeline_cache,
        meshes,
        mesh_allocator,
    );

    for step in blur_schedule(extracted.iterations) {
        let bind_group = match step.src {
            BlurBuffer::Mask => &blur_bind_groups.mask_horizontal,
            BlurBuffer::Ping => &blur_bind_groups.ping_vertical,
            BlurBuffer::Pong => &blur_bind_groups.pong_horizontal,
        };
        let target = match step.dst {
            BlurBuffer::Ping => &blur_targets.ping,
            BlurBuffer::Pong => &blur_targets.pong,
            BlurBuffer::Mask => continue,
        };
        let mut pass = render_context.begin_tracked_render_pass(RenderPassDescriptor {
            label: Some(if step.horizontal {
                "outline_blur_horizontal_pass"
            } else {
                "outline_blur_vertical_pass"
            }),
            color_attachments: &[Some(color_attachment(&target.view))],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_render_pipeline(blur_pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.draw(0..3, 0..1);
    }

    {
        let mut pass = render_context.begin_tracked_render_pass(RenderPassDescriptor {
            label: Some("outline_edge_isolate_pass"),
            color_attachments: &[Some(color_attachment(&blur_targets.edge.view))],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_render_pipeline(edge_pipeline);
        pass.set_bind_group(0, &blur_bind_groups.edge, &[]);
        pass.draw(0..3, 0..1);
    }

    {
        let mut pass = render_context.begin_tracked_render_pass(RenderPassDescriptor {
            label: Some("outline_combine_pass"),
            color_attachments: &[Some(color_attachment(post_process.destination))],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_render_pipeline(combine_pipeline);
        pass.set_bind_group(0, &blur_bind_groups.combine, &[]);
        pass.draw(0..3, 0..1);
    }
}

fn run_convolution(
    render_context: &mut RenderContext,
    view_target: &ViewTarget,
    view_offset: &ViewUniformOffset,
    textures: &OutlineTextures,
    draws: &MaskDrawBuffer,
    view_bind_group: &SilhouetteViewBindGroup,
    bind_groups: &OutlineBindGroups,
    params: &OutlineParamBuffers,
    pipelines: &OutlinePipelines,
    pipeline_cache: &PipelineCache,
    meshes: &RenderAssets<RenderMesh>,
    mesh_allocator: &MeshAllocator,
) {
    let convolution_id = if view_target.is_hdr() {
        pipelines.convolution_pipeline_hdr
    } else {
        pipelines.convolution_pipeline
    };
    let Some(convolution_pipeline) = pipeline_cache.get_render_pipeline(convolution_id) else {
        return;
    };

    record_mask_pass(
        render_context,
        textures,
        draws,
        view_bind_group,
        view_offset,
        bind_groups,
        pipeline_cache,
        meshes,
        mesh_allocator,
    );

    let post_process = view_target.post_process_write();

    // Created each frame because post_process.source changes.
    let bind_group = render_context.render_device().create_bind_group(
        "outline_convolution_bind_group",
        &pipelines.convolution_layout,
        &BindGroupEntries::sequential((
            post_process.source,
            &textures.mask.view,
            &pipelines.sampler,
            params.convolution.as_entire_binding(),
        )),
    );

    let mut pass = render_context.begin_tracked_render_pass(RenderPassDescriptor {
        label: Some("outline_convolution_pass"),
        color_attachments: &[Some(color_attachment(post_process.destination))],
        depth_stencil_attachment: None,
        timestamp_writes: None,
        occlusion_query_set: None,
    });
    pass.set_render_pipeline(convolution_pipeline);
    pass.set_bind_group(0, &bind_group, &[]);
    pass.draw(0..3, 0..1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_length_is_two_plus_two_per_iteration() {
        assert_eq!(blur_schedule(0).len(), 2);
        assert_eq!(blur_schedule(1).len(), 4);
        assert_eq!(blur_schedule(2).len(), 6);
        assert_eq!(blur_schedule(4).len(), 10);
    }

    #[test]
    fn schedule_starts_from_mask_and_ends_in_pong() {
        for iterations in 0..=4 {
            let steps = blur_schedule(iterations);
            assert_eq!(steps[0].src, BlurBuffer::Mask);
            assert_eq!(
                steps.last().map(|s| s.dst),
                Some(BlurBuffer::Pong),
                "edge isolation always samples pong"
            );
        }
    }

    #[test]
    fn schedule_alternates_directions_and_never_self_blurs() {
        let steps = blur_schedule(3);
        for (i, step) in steps.iter().enumerate() {
            assert_eq!(step.horizontal, i % 2 == 0);
            assert_ne!(step.src, step.dst);
        }
        // Each step reads what the previous one wrote.
        for pair in steps.windows(2) {
            assert_eq!(pair[1].src, pair[0].dst);
        }
    }
}
