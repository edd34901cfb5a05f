//! Fullscreen pipelines and per-frame parameter buffers of the outline
//! effect.
//!
//! Sub-pass roles, in the order the orchestrator records them:
//!
//! | Pass | Shader | Role |
//! |---|---|---|
//! | 0 | `blur.wgsl` | directional blur, direction in the `offset` vector |
//! | 1 | `edge_isolate.wgsl` | blur + subtract against the sharp mask |
//! | 2 | `combine.wgsl` | scene copy + edge × strength |
//! | — | `convolution.wgsl` | single-pass edge detect + blend |
//! | — | `blit.wgsl` | pristine scene color copy |

use bevy::{
    prelude::*,
    render::{
        render_resource::{
            binding_types::{sampler as sampler_layout, texture_2d, uniform_buffer},
            AddressMode, BindGroupLayout, BindGroupLayoutDescriptor, BindGroupLayoutEntries,
            Buffer, BufferInitDescriptor, BufferUsages, CachedRenderPipelineId, ColorTargetState,
            ColorWrites, FilterMode, FragmentState, MultisampleState, PipelineCache,
            PrimitiveState, RenderPipelineDescriptor, Sampler, SamplerBindingType,
            SamplerDescriptor, ShaderStages, ShaderType, TextureFormat, TextureSampleType,
            VertexState,
        },
        renderer::{RenderDevice, RenderQueue},
        view::ViewTarget,
    },
};

use crate::{pool::INTERMEDIATE_FORMAT, silhouette::ExtractedOutline};

/// Blur direction and magnitude. Only `xy` is used; the vector stays
/// 4-wide to match the shader-side uniform.
#[derive(Clone, Copy, Default, PartialEq, ShaderType, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct BlurParams {
    pub offset: [f32; 4],
}

/// Combine-pass blend factor in the first component.
#[derive(Clone, Copy, Default, PartialEq, ShaderType, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct CombineParams {
    pub strength: [f32; 4],
}

/// Convolution-pass inputs: outline color plus the kernel width in the
/// first parameter component.
#[derive(Clone, Copy, Default, PartialEq, ShaderType, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct ConvolutionParams {
    pub color: [f32; 4],
    pub params: [f32; 4],
}

/// All cached fullscreen pipelines plus the shared bilinear/clamp
/// sampler. Passes that write to the camera color target exist in an
/// SDR and an HDR variant, selected per view at record time.
#[derive(Resource)]
pub struct OutlinePipelines {
    pub sampler: Sampler,

    pub blur_layout: BindGroupLayout,
    pub blur_pipeline: CachedRenderPipelineId,

    pub edge_layout: BindGroupLayout,
    pub edge_pipeline: CachedRenderPipelineId,

    pub combine_layout: BindGroupLayout,
    pub combine_pipeline: CachedRenderPipelineId,
    pub combine_pipeline_hdr: CachedRenderPipelineId,

    pub convolution_layout: BindGroupLayout,
    pub convolution_pipeline: CachedRenderPipelineId,
    pub convolution_pipeline_hdr: CachedRenderPipelineId,

    pub blit_layout: BindGroupLayout,
    pub blit_pipeline: CachedRenderPipelineId,
    pub blit_pipeline_hdr: CachedRenderPipelineId,
}

impl FromWorld for OutlinePipelines {
    fn from_world(world: &mut World) -> Self {
        let render_device = world.resource::<RenderDevice>();
        let asset_server = world.resource::<AssetServer>();
        let pipeline_cache = world.resource::<PipelineCache>();

        let sampler = render_device.create_sampler(&SamplerDescriptor {
            label: Some("outline_linear_clamp_sampler"),
            address_mode_u: AddressMode::ClampToEdge,
            address_mode_v: AddressMode::ClampToEdge,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            ..Default::default()
        });

        let fullscreen_shader = asset_server
            .load("embedded://bevy_core_pipeline/fullscreen_vertex_shader/fullscreen.wgsl");
        let blur_shader = asset_server.load("embedded://bevy_blur_outline/shaders/blur.wgsl");
        let edge_shader =
            asset_server.load("embedded://bevy_blur_outline/shaders/edge_isolate.wgsl");
        let combine_shader =
            asset_server.load("embedded://bevy_blur_outline/shaders/combine.wgsl");
        let convolution_shader =
            asset_server.load("embedded://bevy_blur_outline/shaders/convolution.wgsl");
        let blit_shader = asset_server.load("embedded://bevy_blur_outline/shaders/blit.wgsl");

        let blur_entries = BindGroupLayoutEntries::sequential(
            ShaderStages::FRAGMENT,
            (
                texture_2d(TextureSampleType::Float { filterable: true }),
                sampler_layout(SamplerBindingType::Filtering),
                uniform_buffer::<BlurParams>(false),
            ),
        );
        let blur_layout =
            render_device.create_bind_group_layout(Some("outline_blur_layout"), &blur_entries);
        let blur_layout_descriptor =
            BindGroupLayoutDescriptor::new("outline_blur_layout", &blur_entries);

        let edge_entries = BindGroupLayoutEntries::sequential(
            ShaderStages::FRAGMENT,
            (
                // Blurred mask.
                texture_2d(TextureSampleType::Float { filterable: true }),
                // Sharp mask.
                texture_2d(TextureSampleType::Float { filterable: true }),
                sampler_layout(SamplerBindingType::Filtering),
                uniform_buffer::<BlurParams>(false),
            ),
        );
        let edge_layout =
            render_device.create_bind_group_layout(Some("outline_edge_layout"), &edge_entries);
        let edge_layout_descriptor =
            BindGroupLayoutDescriptor::new("outline_edge_layout", &edge_entries);

        let combine_entries = BindGroupLayoutEntries::sequential(
            ShaderStages::FRAGMENT,
            (
                // Pristine scene copy.
                texture_2d(TextureSampleType::Float { filterable: true }),
                // Edge ring.
                texture_2d(TextureSampleType::Float { filterable: true }),
                sampler_layout(SamplerBindingType::Filtering),
                uniform_buffer::<CombineParams>(false),
            ),
        );
        let combine_layout = render_device
            .create_bind_group_layout(Some("outline_combine_layout"), &combine_entries);
        let combine_layout_descriptor =
            BindGroupLayoutDescriptor::new("outline_combine_layout", &combine_entries);

        let convolution_entries = BindGroupLayoutEntries::sequential(
            ShaderStages::FRAGMENT,
            (
                // Scene color.
                texture_2d(TextureSampleType::Float { filterable: true }),
                // Mask.
                texture_2d(TextureSampleType::Float { filterable: true }),
                sampler_layout(SamplerBindingType::Filtering),
                uniform_buffer::<ConvolutionParams>(false),
            ),
        );
        let convolution_layout = render_device
            .create_bind_group_layout(Some("outline_convolution_layout"), &convolution_entries);
        let convolution_layout_descriptor =
            BindGroupLayoutDescriptor::new("outline_convolution_layout", &convolution_entries);

        let blit_entries = BindGroupLayoutEntries::sequential(
            ShaderStages::FRAGMENT,
            (
                texture_2d(TextureSampleType::Float { filterable: true }),
                sampler_layout(SamplerBindingType::Filtering),
            ),
        );
        let blit_layout =
            render_device.create_bind_group_layout(Some("outline_blit_layout"), &blit_entries);
        let blit_layout_descriptor =
            BindGroupLayoutDescriptor::new("outline_blit_layout", &blit_entries);

        let queue_fullscreen = |label: &'static str,
                                layout: BindGroupLayoutDescriptor,
                                shader: &Handle<Shader>,
                                format: TextureFormat| {
            pipeline_cache.queue_render_pipeline(RenderPipelineDescriptor {
                label: Some(label.into()),
                layout: vec![layout],
                vertex: VertexState {
                    shader: fullscreen_shader.clone(),
                    shader_defs: vec![],
                    entry_point: Some("fullscreen_vertex_shader".into()),
                    buffers: vec![],
                },
                fragment: Some(FragmentState {
                    shader: shader.clone(),
                    shader_defs: vec![],
                    entry_point: Some("fragment".into()),
                    targets: vec![Some(ColorTargetState {
                        format,
                        blend: None,
                        write_mask: ColorWrites::ALL,
                    })],
                }),
                primitive: PrimitiveState::default(),
                depth_stencil: None,
                multisample: MultisampleState::default(),
                push_constant_ranges: vec![],
                zero_initialize_workgroup_memory: false,
            })
        };

        let blur_pipeline = queue_fullscreen(
            "outline_blur_pipeline",
            blur_layout_descriptor,
            &blur_shader,
            INTERMEDIATE_FORMAT,
        );
        let edge_pipeline = queue_fullscreen(
            "outline_edge_pipeline",
            edge_layout_descriptor,
            &edge_shader,
            INTERMEDIATE_FORMAT,
        );
        let combine_pipeline = queue_fullscreen(
            "outline_combine_pipeline",
            combine_layout_descriptor.clone(),
            &combine_shader,
            TextureFormat::bevy_default(),
        );
        let combine_pipeline_hdr = queue_fullscreen(
            "outline_combine_pipeline_hdr",
            combine_layout_descriptor,
            &combine_shader,
            ViewTarget::TEXTURE_FORMAT_HDR,
        );
        let convolution_pipeline = queue_fullscreen(
            "outline_convolution_pipeline",
            convolution_layout_descriptor.clone(),
            &convolution_shader,
            TextureFormat::bevy_default(),
        );
        let convolution_pipeline_hdr = queue_fullscreen(
            "outline_convolution_pipeline_hdr",
            convolution_layout_descriptor,
            &convolution_shader,
            ViewTarget::TEXTURE_FORMAT_HDR,
        );
        let blit_pipeline = queue_fullscreen(
            "outline_copy_color_pipeline",
            blit_layout_descriptor.clone(),
            &blit_shader,
            TextureFormat::bevy_default(),
        );
        let blit_pipeline_hdr = queue_fullscreen(
            "outline_copy_color_pipeline_hdr",
            blit_layout_descriptor,
            &blit_shader,
            ViewTarget::TEXTURE_FORMAT_HDR,
        );

        Self {
            sampler,
            blur_layout,
            blur_pipeline,
            edge_layout,
            edge_pipeline,
            combine_layout,
            combine_pipeline,
            combine_pipeline_hdr,
            convolution_layout,
            convolution_pipeline,
            convolution_pipeline_hdr,
            blit_layout,
            blit_pipeline,
            blit_pipeline_hdr,
        }
    }
}

/// Per-view uniform buffers for the blur offsets and blend parameters.
/// Rewritten in place only when the camera's configuration changed.
#[derive(Component)]
pub struct OutlineParamBuffers {
    pub blur_horizontal: Buffer,
    pub blur_vertical: Buffer,
    pub combine: Buffer,
    pub convolution: Buffer,
    cached_sampler_area: f32,
    cached_strength: f32,
    cached_color: LinearRgba,
}

fn blur_params(extracted: &ExtractedOutline) -> (BlurParams, BlurParams) {
    (
        BlurParams {
            offset: [extracted.sampler_area, 0.0, 0.0, 0.0],
        },
        BlurParams {
            offset: [0.0, extracted.sampler_area, 0.0, 0.0],
        },
    )
}

fn combine_params(extracted: &ExtractedOutline) -> CombineParams {
    CombineParams {
        strength: [extracted.strength, 0.0, 0.0, 0.0],
    }
}

fn convolution_params(extracted: &ExtractedOutline) -> ConvolutionParams {
    ConvolutionParams {
        color: [
            extracted.color.red,
            extracted.color.green,
            extracted.color.blue,
            extracted.color.alpha,
        ],
        // The convolution kernel's sample spread reuses the sampler
        // area as its width input.
        params: [extracted.sampler_area, 0.0, 0.0, 0.0],
    }
}

/// Creates or updates each view's parameter buffers.
pub fn prepare_outline_uniforms(
    mut commands: Commands,
    render_device: Res<RenderDevice>,
    render_queue: Res<RenderQueue>,
    mut views: Query<(Entity, &ExtractedOutline, Option<&mut OutlineParamBuffers>)>,
) {
    for (entity, extracted, existing) in &mut views {
        if let Some(mut buffers) = existing {
            if buffers.cached_sampler_area == extracted.sampler_area
                && buffers.cached_strength == extracted.strength
                && buffers.cached_color == extracted.color
            {
                continue;
            }
            let (horizontal, vertical) = blur_params(extracted);
            render_queue.write_buffer(
                &buffers.blur_horizontal,
                0,
                bytemuck::bytes_of(&horizontal),
            );
            render_queue.write_buffer(&buffers.blur_vertical, 0, bytemuck::bytes_of(&vertical));
            render_queue.write_buffer(
                &buffers.combine,
                0,
                bytemuck::bytes_of(&combine_params(extracted)),
            );
            render_queue.write_buffer(
                &buffers.convolution,
                0,
                bytemuck::bytes_of(&convolution_params(extracted)),
            );
            buffers.cached_sampler_area = extracted.sampler_area;
            buffers.cached_strength = extracted.strength;
            buffers.cached_color = extracted.color;
            continue;
        }

        let (horizontal, vertical) = blur_params(extracted);
        let create = |label: &'static str, contents: &[u8]| {
            render_device.create_buffer_with_data(&BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
            })
        };
        commands.entity(entity).insert(OutlineParamBuffers {
            blur_horizontal: create(
                "outline_blur_horizontal_params",
                bytemuck::bytes_of(&horizontal),
            ),
            blur_vertical: create("outline_blur_vertical_params", bytemuck::bytes_of(&vertical)),
            combine: create(
                "outline_combine_params",
                bytemuck::bytes_of(&combine_params(extracted)),
            ),
            convolution: create(
                "outline_convolution_params",
                bytemuck::bytes_of(&convolution_params(extracted)),
            ),
            cached_sampler_area: extracted.sampler_area,
            cached_strength: extracted.strength,
            cached_color: extracted.color,
        });
    }
}
