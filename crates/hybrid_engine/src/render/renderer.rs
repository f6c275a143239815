//! # Render graph
//!
//! The renderer owns the pipelines of the three passes and the render targets
//! they write. Per frame the application calls, in order,
//! [`render_raster_pass`](Renderer::render_raster_pass) and
//! [`render_ray_trace_pass`](Renderer::render_ray_trace_pass) after
//! `SceneGraph::sync`, then optionally
//! [`prepare_for_present`](Renderer::prepare_for_present).
//!
//! ## Passes
//!
//! - **Environment backdrop**: full-screen draw, no depth test
//! - **Entities**: every entity drawn twice, once into the picking target and
//!   once into the shaded G-buffer targets
//! - **Ray tracing**: one ray per pixel over the scene's top-level structure,
//!   accumulating into the ray-tracing film
//!
//! Target layouts are tracked per image, and every transition waits on the
//! previous writer of that image.

use ash::vk;

use crate::assets::Vertex;
use crate::foundation::logging::{debug, info, warn};
use crate::render::api::{
    CommandBufferHandle, DescriptorSetLayoutHandle, DeviceError, GraphicsPipelineDesc, ImageHandle, PipelineHandle,
    PipelineLayoutHandle, RayTracingPipelineDesc, RenderDevice, RenderPassHandle,
};
use crate::render::film::{Film, RayTracingFilm};
use crate::render::resources::{transition_images, ImageState, ShaderBindingTable, ShaderLibrary};
use crate::render::RenderError;
use crate::scene::SceneGraph;

/// Miss shaders: primary rays and shadow rays
const MISS_SHADER_COUNT: u32 = 2;

/// Closest-hit shaders
const HIT_SHADER_COUNT: u32 = 1;

/// Image handed to the presentation collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputImage {
    /// Raster albedo
    Albedo,
    /// Raster world-space position
    Position,
    /// Raster world-space normal
    Normal,
    /// Raster radiance
    Radiance,
    /// Accumulated ray-traced result
    #[default]
    RayTraced,
}

fn pipeline_error(name: &'static str) -> impl FnOnce(DeviceError) -> RenderError {
    move |e| RenderError::PipelineCreation(format!("{name}: {e}"))
}

/// Pipelines and render targets of the hybrid renderer
pub struct Renderer {
    render_pass: RenderPassHandle,
    film: Film,
    rt_film: RayTracingFilm,

    envmap_layout: PipelineLayoutHandle,
    envmap_pipeline: PipelineHandle,
    entity_layout: PipelineLayoutHandle,
    entity_pipeline: PipelineHandle,
    ray_tracing_layout: PipelineLayoutHandle,
    ray_tracing_pipeline: PipelineHandle,
    sbt: ShaderBindingTable,
}

impl Renderer {
    /// Create the render targets, the three pipelines and the shader binding
    /// table. Every shader in
    /// [`REQUIRED_SHADERS`](crate::render::resources::REQUIRED_SHADERS) must be
    /// in `shaders`.
    pub fn new(
        device: &mut dyn RenderDevice,
        shaders: &ShaderLibrary,
        scene: &SceneGraph,
        width: u32,
        height: u32,
    ) -> Result<Self, RenderError> {
        let layouts = scene.layouts();

        let render_pass = device
            .create_render_pass(&Film::render_pass_desc())
            .map_err(pipeline_error("raster render pass"))?;
        let film = Film::new(device, render_pass, width, height)?;
        let rt_film = RayTracingFilm::new(device, width, height)?;

        let envmap_layout = device
            .create_pipeline_layout(&[layouts.scene, layouts.envmap])
            .map_err(pipeline_error("envmap layout"))?;
        let envmap_pipeline = device
            .create_graphics_pipeline(&GraphicsPipelineDesc {
                name: "envmap",
                layout: envmap_layout,
                render_pass,
                vertex_spirv: shaders.get("envmap.vert")?,
                fragment_spirv: shaders.get("envmap.frag")?,
                vertex_input: None,
                color_attachment_count: Film::COLOR_ATTACHMENT_COUNT,
                depth_test: false,
                depth_write: false,
                cull_mode: vk::CullModeFlags::NONE,
            })
            .map_err(pipeline_error("envmap pipeline"))?;

        let entity_layout = device
            .create_pipeline_layout(&[layouts.scene, layouts.entity])
            .map_err(pipeline_error("entity layout"))?;
        let entity_pipeline = device
            .create_graphics_pipeline(&GraphicsPipelineDesc {
                name: "entity",
                layout: entity_layout,
                render_pass,
                vertex_spirv: shaders.get("entity.vert")?,
                fragment_spirv: shaders.get("entity.frag")?,
                vertex_input: Some(Vertex::layout()),
                color_attachment_count: Film::COLOR_ATTACHMENT_COUNT,
                depth_test: true,
                depth_write: true,
                cull_mode: vk::CullModeFlags::BACK,
            })
            .map_err(pipeline_error("entity pipeline"))?;

        let ray_tracing_sets: [DescriptorSetLayoutHandle; 5] = [
            layouts.scene,
            layouts.acceleration,
            scene.assets().bindless_layout(),
            layouts.envmap,
            rt_film.layout(),
        ];
        let ray_tracing_layout = device
            .create_pipeline_layout(&ray_tracing_sets)
            .map_err(pipeline_error("ray tracing layout"))?;
        let ray_tracing_pipeline = device
            .create_ray_tracing_pipeline(&RayTracingPipelineDesc {
                name: "raytrace",
                layout: ray_tracing_layout,
                raygen_spirv: shaders.get("raytrace.rgen")?,
                miss_spirv: vec![shaders.get("raytrace.rmiss")?, shaders.get("shadow.rmiss")?],
                closest_hit_spirv: vec![shaders.get("raytrace.rchit")?],
                max_recursion_depth: 1,
            })
            .map_err(pipeline_error("ray tracing pipeline"))?;
        let sbt = ShaderBindingTable::new(device, ray_tracing_pipeline, MISS_SHADER_COUNT, HIT_SHADER_COUNT)?;

        info!("[RENDER] Renderer ready at {}x{}", width, height);
        Ok(Self {
            render_pass,
            film,
            rt_film,
            envmap_layout,
            envmap_pipeline,
            entity_layout,
            entity_pipeline,
            ray_tracing_layout,
            ray_tracing_pipeline,
            sbt,
        })
    }

    /// Raster targets
    pub fn film(&self) -> &Film {
        &self.film
    }

    /// Ray-tracing targets
    pub fn rt_film(&self) -> &RayTracingFilm {
        &self.rt_film
    }

    /// Shader binding table of the ray-trace pass
    pub fn shader_binding_table(&self) -> &ShaderBindingTable {
        &self.sbt
    }

    /// Output size
    pub fn extent(&self) -> vk::Extent2D {
        self.film.extent()
    }

    /// Record the raster pass: environment backdrop, depth clear, entities.
    ///
    /// Leaves the G-buffer ready for shader reads and the picking target
    /// ready for [`pick`](Self::pick).
    pub fn render_raster_pass(
        &mut self,
        device: &mut dyn RenderDevice,
        cmd: CommandBufferHandle,
        scene: &SceneGraph,
        frame: usize,
    ) -> Result<(), RenderError> {
        let graphics = vk::PipelineBindPoint::GRAPHICS;

        self.film.begin_raster(device, cmd);
        device.cmd_begin_render_pass(cmd, self.render_pass, self.film.framebuffer(), &Film::clear_values())?;

        device.cmd_bind_pipeline(cmd, graphics, self.envmap_pipeline);
        device.cmd_bind_descriptor_sets(cmd, graphics, self.envmap_layout, 0, &[scene.scene_set(frame)]);
        scene.draw_envmap(device, cmd, self.envmap_layout, frame);

        device.cmd_clear_depth(cmd, self.film.extent(), 1.0);

        device.cmd_bind_pipeline(cmd, graphics, self.entity_pipeline);
        device.cmd_bind_descriptor_sets(cmd, graphics, self.entity_layout, 0, &[scene.scene_set(frame)]);
        let drawn = scene.draw_entities(device, cmd, self.entity_layout, frame);

        device.cmd_end_render_pass(cmd);
        self.film.end_raster(device, cmd);
        drawn?;
        Ok(())
    }

    /// Record the ray-trace pass: bind the pipeline and its five sets, then
    /// dispatch one ray per output pixel.
    ///
    /// Skipped until the scene has built its first top-level structure.
    pub fn render_ray_trace_pass(
        &mut self,
        device: &mut dyn RenderDevice,
        cmd: CommandBufferHandle,
        scene: &SceneGraph,
        frame: usize,
    ) -> Result<(), RenderError> {
        if scene.tlas().handle().is_none() {
            debug!("[RENDER] No top-level structure yet, ray trace pass skipped");
            return Ok(());
        }
        let ray_tracing = vk::PipelineBindPoint::RAY_TRACING_KHR;

        self.rt_film.begin_trace(device, cmd);
        device.cmd_bind_pipeline(cmd, ray_tracing, self.ray_tracing_pipeline);
        device.cmd_bind_descriptor_sets(
            cmd,
            ray_tracing,
            self.ray_tracing_layout,
            0,
            &[
                scene.scene_set(frame),
                scene.acceleration_set(frame),
                scene.assets().bindless_set(frame),
                scene.envmap().descriptor_set(frame),
                self.rt_film.descriptor_set(),
            ],
        );
        let extent = self.rt_film.extent();
        device.cmd_trace_rays(cmd, self.sbt.regions(), extent.width, extent.height);
        Ok(())
    }

    /// Move `output` to `TRANSFER_SRC_OPTIMAL` for the presenter's copy and
    /// return its image.
    pub fn prepare_for_present(
        &mut self,
        device: &mut dyn RenderDevice,
        cmd: CommandBufferHandle,
        output: OutputImage,
    ) -> ImageHandle {
        let image = match output {
            OutputImage::Albedo => self.film.albedo().handle(),
            OutputImage::Position => self.film.position().handle(),
            OutputImage::Normal => self.film.normal().handle(),
            OutputImage::Radiance => self.film.radiance().handle(),
            OutputImage::RayTraced => self.rt_film.result().handle(),
        };
        let tracked = match output {
            OutputImage::RayTraced => self.rt_film.image_mut(image),
            _ => self.film.image_mut(image),
        };
        if let Some(tracked) = tracked {
            transition_images(device, cmd, &mut [tracked], ImageState::TRANSFER_SRC);
        }
        image
    }

    /// Picking query at pixel `(x, y)` of the last raster pass
    pub fn pick(&self, device: &mut dyn RenderDevice, x: i32, y: i32) -> Result<[u32; 2], RenderError> {
        Ok(self.film.pick(device, x, y)?)
    }

    /// Output size changed: quiesce, resize both films and rebuild the
    /// framebuffer. The scene's projection follows the new aspect ratio.
    ///
    /// A zero-sized output (minimized window) is ignored.
    pub fn resize(
        &mut self,
        device: &mut dyn RenderDevice,
        scene: &mut SceneGraph,
        width: u32,
        height: u32,
    ) -> Result<(), RenderError> {
        if width == 0 || height == 0 {
            warn!("[RENDER] Ignoring resize to {}x{}", width, height);
            return Ok(());
        }
        if self.film.extent() == (vk::Extent2D { width, height }) {
            return Ok(());
        }
        device.wait_idle()?;
        self.film.resize(device, width, height)?;
        self.rt_film.resize(device, width, height)?;
        scene.set_output_extent(width, height);
        scene.reset_accumulation();
        info!("[RENDER] Resized to {}x{}", width, height);
        Ok(())
    }

    /// Release pipelines, layouts and targets
    pub fn destroy(self, device: &mut dyn RenderDevice) -> Result<(), RenderError> {
        device.wait_idle()?;
        self.sbt.destroy(device);
        for pipeline in [self.envmap_pipeline, self.entity_pipeline, self.ray_tracing_pipeline] {
            device.destroy_pipeline(pipeline);
        }
        for layout in [self.envmap_layout, self.entity_layout, self.ray_tracing_layout] {
            device.destroy_pipeline_layout(layout);
        }
        self.film.destroy(device);
        let rt_layout = self.rt_film.layout();
        self.rt_film.destroy(device);
        device.destroy_descriptor_set_layout(rt_layout);
        device.destroy_render_pass(self.render_pass);
        debug!("[RENDER] Renderer destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EngineConfig;
    use crate::render::backends::headless::{HeadlessDevice, RecordedCommand};
    use crate::render::resources::REQUIRED_SHADERS;
    use crate::render::NO_ENTITY;

    fn setup(width: u32, height: u32) -> (HeadlessDevice, SceneGraph, Renderer) {
        let mut device = HeadlessDevice::new(2);
        let config = EngineConfig {
            max_entities: 8,
            ..EngineConfig::headless(width, height)
        };
        let scene = SceneGraph::new(&mut device, &config).unwrap();
        let shaders = ShaderLibrary::stub(REQUIRED_SHADERS);
        let renderer = Renderer::new(&mut device, &shaders, &scene, width, height).unwrap();
        (device, scene, renderer)
    }

    fn run_frame(device: &mut HeadlessDevice, scene: &mut SceneGraph, renderer: &mut Renderer) {
        let frame = device.begin_frame().unwrap();
        let (cmd, index) = (frame.command_buffer, frame.frame_index);
        scene.update(device, 0.016).unwrap();
        scene.sync(device, cmd, index).unwrap();
        renderer.render_raster_pass(device, cmd, scene, index).unwrap();
        renderer.render_ray_trace_pass(device, cmd, scene, index).unwrap();
        renderer.prepare_for_present(device, cmd, OutputImage::RayTraced);
        device.end_frame(frame).unwrap();
    }

    fn position(commands: &[RecordedCommand], wanted: impl Fn(&RecordedCommand) -> bool) -> usize {
        commands.iter().position(wanted).expect("command not recorded")
    }

    #[test]
    fn test_missing_shader_fails_startup() {
        let mut device = HeadlessDevice::new(2);
        let scene = SceneGraph::new(&mut device, &EngineConfig::headless(8, 8)).unwrap();
        let shaders = ShaderLibrary::stub(&REQUIRED_SHADERS[..REQUIRED_SHADERS.len() - 1]);
        let result = Renderer::new(&mut device, &shaders, &scene, 8, 8);
        assert!(matches!(result, Err(RenderError::MissingShader(name)) if name == "raytrace.rchit"));
    }

    #[test]
    fn test_frame_records_passes_in_order() {
        let (mut device, mut scene, mut renderer) = setup(16, 8);
        scene.create_entity(&mut device).unwrap();
        scene.create_entity(&mut device).unwrap();
        run_frame(&mut device, &mut scene, &mut renderer);

        let commands = device.last_submitted_commands();
        let begin = position(commands, |c| matches!(c, RecordedCommand::BeginRenderPass { .. }));
        let backdrop = position(commands, |c| {
            matches!(c, RecordedCommand::Draw { vertex_count: 6, instance_count: 1 })
        });
        let clear = position(commands, |c| matches!(c, RecordedCommand::ClearDepth));
        let end = position(commands, |c| matches!(c, RecordedCommand::EndRenderPass));
        let trace = position(commands, |c| matches!(c, RecordedCommand::TraceRays { width: 16, height: 8 }));
        assert!(begin < backdrop && backdrop < clear && clear < end && end < trace);

        let entity_draws = commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::DrawIndexed { instance_count: 2, .. }))
            .count();
        assert_eq!(entity_draws, 2);

        let rt_binds = commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::BindDescriptorSets { bind_point, sets, .. }
                    if *bind_point == vk::PipelineBindPoint::RAY_TRACING_KHR =>
                {
                    Some(sets.len())
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(rt_binds, vec![5]);
    }

    #[test]
    fn test_steady_frames_keep_layouts_consistent() {
        let (mut device, mut scene, mut renderer) = setup(8, 8);
        scene.create_entity(&mut device).unwrap();
        for _ in 0..5 {
            run_frame(&mut device, &mut scene, &mut renderer);
        }
        let stats = device.stats();
        assert_eq!(stats.layout_mismatches, 0);
        assert_eq!(stats.stale_descriptor_binds, 0);
        assert_eq!(
            device.image_layout(renderer.rt_film().result().handle()),
            Some(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        );
        assert_eq!(
            device.image_layout(renderer.film().normal().handle()),
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        );
    }

    #[test]
    fn test_ray_trace_pass_waits_for_first_update() {
        let (mut device, scene, mut renderer) = setup(8, 8);
        let frame = device.begin_frame().unwrap();
        renderer
            .render_ray_trace_pass(&mut device, frame.command_buffer, &scene, frame.frame_index)
            .unwrap();
        assert!(!device
            .recorded_commands(frame.command_buffer)
            .iter()
            .any(|c| matches!(c, RecordedCommand::TraceRays { .. })));
        device.end_frame(frame).unwrap();
    }

    #[test]
    fn test_resize_quiesces_and_follows_new_extent() {
        let (mut device, mut scene, mut renderer) = setup(8, 8);
        scene.create_entity(&mut device).unwrap();
        run_frame(&mut device, &mut scene, &mut renderer);

        let waits = device.stats().wait_idle_calls;
        renderer.resize(&mut device, &mut scene, 0, 20).unwrap();
        assert_eq!(renderer.extent(), vk::Extent2D { width: 8, height: 8 });
        assert_eq!(device.stats().wait_idle_calls, waits);

        renderer.resize(&mut device, &mut scene, 20, 10).unwrap();
        assert_eq!(device.stats().wait_idle_calls, waits + 1);
        assert_eq!(renderer.extent(), vk::Extent2D { width: 20, height: 10 });
        assert_eq!(scene.output_extent(), vk::Extent2D { width: 20, height: 10 });

        run_frame(&mut device, &mut scene, &mut renderer);
        assert!(device
            .last_submitted_commands()
            .iter()
            .any(|c| matches!(c, RecordedCommand::TraceRays { width: 20, height: 10 })));
        assert_eq!(device.stats().layout_mismatches, 0);
    }

    #[test]
    fn test_pick_after_frame_and_outside_bounds() {
        let (mut device, mut scene, mut renderer) = setup(8, 8);
        scene.create_entity(&mut device).unwrap();
        assert_eq!(renderer.pick(&mut device, 2, 2).unwrap(), NO_ENTITY);

        run_frame(&mut device, &mut scene, &mut renderer);
        // Nothing shades the picking target on the headless device.
        assert_eq!(renderer.pick(&mut device, 2, 2).unwrap(), NO_ENTITY);
        assert_eq!(renderer.pick(&mut device, 8, 0).unwrap(), NO_ENTITY);
        assert_eq!(renderer.pick(&mut device, -3, 4).unwrap(), NO_ENTITY);
    }

    #[test]
    fn test_present_transitions_chosen_output() {
        let (mut device, mut scene, mut renderer) = setup(8, 8);
        run_frame(&mut device, &mut scene, &mut renderer);

        let frame = device.begin_frame().unwrap();
        let image = renderer.prepare_for_present(&mut device, frame.command_buffer, OutputImage::Albedo);
        device.end_frame(frame).unwrap();
        assert_eq!(image, renderer.film().albedo().handle());
        assert_eq!(device.image_layout(image), Some(vk::ImageLayout::TRANSFER_SRC_OPTIMAL));
    }

    #[test]
    fn test_teardown_releases_every_object() {
        let (mut device, mut scene, mut renderer) = setup(8, 8);
        scene.create_entity(&mut device).unwrap();
        run_frame(&mut device, &mut scene, &mut renderer);

        renderer.destroy(&mut device).unwrap();
        scene.destroy(&mut device).unwrap();
        assert_eq!(device.live_object_count(), 0);
    }
}
