//! End-to-end frame protocol tests on the headless device

use hybrid_engine::prelude::*;
use hybrid_engine::render::backends::RecordedCommand;

const FRAMES_IN_FLIGHT: usize = 2;

struct Harness {
    device: HeadlessDevice,
    scene: SceneGraph,
    renderer: Renderer,
}

impl Harness {
    fn new(width: u32, height: u32) -> Self {
        hybrid_engine::foundation::logging::init_for_tests();
        let mut device = HeadlessDevice::new(FRAMES_IN_FLIGHT);
        let config = EngineConfig {
            max_entities: 32,
            ..EngineConfig::headless(width, height)
        };
        let scene = SceneGraph::new(&mut device, &config).unwrap();
        let shaders = ShaderLibrary::stub(REQUIRED_SHADERS);
        let renderer = Renderer::new(&mut device, &shaders, &scene, width, height).unwrap();
        Self { device, scene, renderer }
    }

    fn frame(&mut self) {
        let frame = self.device.begin_frame().unwrap();
        let (cmd, index) = (frame.command_buffer, frame.frame_index);
        self.scene.update(&mut self.device, 1.0 / 60.0).unwrap();
        self.scene.sync(&mut self.device, cmd, index).unwrap();
        self.renderer
            .render_raster_pass(&mut self.device, cmd, &self.scene, index)
            .unwrap();
        self.renderer
            .render_ray_trace_pass(&mut self.device, cmd, &self.scene, index)
            .unwrap();
        self.renderer
            .prepare_for_present(&mut self.device, cmd, OutputImage::RayTraced);
        self.device.end_frame(frame).unwrap();
    }

    fn teardown(mut self) -> usize {
        self.renderer.destroy(&mut self.device).unwrap();
        self.scene.destroy(&mut self.device).unwrap();
        self.device.live_object_count()
    }
}

#[test]
fn test_built_in_scenes_render_steadily() {
    for (name, load) in built_in_scenes() {
        let mut harness = Harness::new(32, 18);
        load(&mut harness.scene, &mut harness.device).unwrap();

        for _ in 0..6 {
            harness.frame();
        }

        let stats = harness.device.stats();
        assert_eq!(stats.frames_submitted, 6, "{name}");
        assert_eq!(stats.tlas_builds, 1, "{name} rebuilt without a count change");
        assert_eq!(stats.tlas_refits, 5, "{name}");
        assert_eq!(stats.layout_mismatches, 0, "{name}");
        assert_eq!(stats.stale_descriptor_binds, 0, "{name}");
        assert_eq!(harness.teardown(), 0, "{name} leaked device objects");
    }
}

#[test]
fn test_every_frame_traces_at_output_size() {
    let mut harness = Harness::new(24, 12);
    load_cornell_box(&mut harness.scene, &mut harness.device).unwrap();
    harness.frame();
    harness.frame();

    let commands = harness.device.last_submitted_commands();
    let refit = commands
        .iter()
        .position(|c| matches!(c, RecordedCommand::RefitTlas { instance_count: 8, .. }))
        .expect("refit recorded");
    let trace = commands
        .iter()
        .position(|c| matches!(c, RecordedCommand::TraceRays { width: 24, height: 12 }))
        .expect("trace recorded");
    assert!(refit < trace);
}

#[test]
fn test_entity_removal_rebuilds_and_keeps_rendering() {
    let mut harness = Harness::new(16, 16);
    load_cornell_box(&mut harness.scene, &mut harness.device).unwrap();
    harness.frame();
    harness.frame();

    let victim = harness.scene.entity_ids()[3];
    harness.scene.destroy_entity(&mut harness.device, victim).unwrap();
    harness.frame();

    assert_eq!(harness.scene.tlas().instance_count(), 7);
    assert_eq!(harness.device.stats().tlas_builds, 2);
    assert_eq!(harness.device.stats().stale_descriptor_binds, 0);
    let draws = harness
        .device
        .last_submitted_commands()
        .iter()
        .filter(|c| matches!(c, RecordedCommand::DrawIndexed { instance_count: 2, .. }))
        .count();
    assert_eq!(draws, 7);
    assert_eq!(harness.teardown(), 0);
}

#[test]
fn test_slots_alternate_and_retire() {
    let mut harness = Harness::new(8, 8);
    harness.scene.create_entity(&mut harness.device).unwrap();

    assert_eq!(harness.device.current_frame(), 0);
    harness.frame();
    assert_eq!(harness.device.current_frame(), 1);
    assert!(harness.device.frame_pending(0));

    harness.frame();
    assert!(harness.device.frame_pending(1));
    assert_eq!(harness.device.current_frame(), 0);

    // Beginning slot 0 again waits for its previous submission.
    let frame = harness.device.begin_frame().unwrap();
    assert!(!harness.device.frame_pending(0));
    assert!(harness.device.frame_pending(1));
    harness.device.end_frame(frame).unwrap();
}

#[test]
fn test_picking_drives_selection() {
    let mut harness = Harness::new(8, 8);
    let entity = harness.scene.create_entity(&mut harness.device).unwrap();
    harness.frame();

    let mut selection = SelectionState::default();
    selection.hover(harness.renderer.pick(&mut harness.device, 4, 4).unwrap());
    assert!(!selection.is_hovering());

    let pair = [entity.0, 1];
    let stencil = harness.renderer.film().stencil().handle();
    harness
        .device
        .write_image_texel(stencil, 4, 4, bytemuck::cast_slice(&pair))
        .unwrap();
    selection.hover(harness.renderer.pick(&mut harness.device, 4, 4).unwrap());
    assert!(selection.is_hovering());
    selection.select_hovered();
    assert_eq!(selection.selected(), pair);

    assert_eq!(harness.renderer.pick(&mut harness.device, -1, 4).unwrap(), NO_ENTITY);
    assert_eq!(harness.renderer.pick(&mut harness.device, 4, 8).unwrap(), NO_ENTITY);
}

#[test]
fn test_resize_between_frames() {
    let mut harness = Harness::new(16, 8);
    load_island(&mut harness.scene, &mut harness.device).unwrap();
    harness.frame();

    harness
        .renderer
        .resize(&mut harness.device, &mut harness.scene, 40, 20)
        .unwrap();
    harness.frame();

    assert!(harness
        .device
        .last_submitted_commands()
        .iter()
        .any(|c| matches!(c, RecordedCommand::TraceRays { width: 40, height: 20 })));
    assert_eq!(harness.device.stats().layout_mismatches, 0);
    assert_eq!(harness.teardown(), 0);
}
