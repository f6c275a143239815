//! Headless island demo
//!
//! Loads one of the built-in scenes and drives the per-frame protocol
//! (update, sync, raster, ray trace, present, end frame) on the CPU-only
//! device for a fixed number of frames, then prints what the device saw.
//!
//! Usage: `island_headless [scene name] [config.toml|config.ron]`
//!
//! The configuration must have `headless = true`. Shaders are loaded from
//! `shader_directory` when it exists; otherwise stub modules stand in, which
//! is all the headless device needs.

use hybrid_engine::config::ConfigError;
use hybrid_engine::prelude::*;
use hybrid_engine::render::backends::DeviceStats;
use log::{error, info};
use thiserror::Error;

const FRAME_COUNT: u64 = 120;
const FIXED_DELTA: f32 = 1.0 / 60.0;

#[derive(Error, Debug)]
enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unknown scene '{0}'")]
    UnknownScene(String),

    #[error("island_headless only drives the headless device; set `headless = true`")]
    NotHeadless,

    #[error(transparent)]
    Render(#[from] RenderError),
}

impl From<SceneError> for AppError {
    fn from(error: SceneError) -> Self {
        Self::Render(RenderError::Scene(error))
    }
}

impl From<hybrid_engine::render::api::DeviceError> for AppError {
    fn from(error: hybrid_engine::render::api::DeviceError) -> Self {
        Self::Render(RenderError::Device(error))
    }
}

struct IslandApp {
    device: HeadlessDevice,
    scene: SceneGraph,
    renderer: Renderer,
    timer: Timer,
    selection: SelectionState,
}

impl IslandApp {
    fn new(config: &EngineConfig, scene_name: &str) -> Result<Self, AppError> {
        let (_, load) = built_in_scenes()
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(scene_name))
            .ok_or_else(|| AppError::UnknownScene(scene_name.to_string()))?;

        let mut device = HeadlessDevice::new(config.frames_in_flight as usize);
        let mut scene = SceneGraph::new(&mut device, config)?;
        load(&mut scene, &mut device)?;
        info!("Loaded scene '{}' with {} entities", scene_name, scene.entity_count());

        let shaders = shader_library(config)?;
        let renderer = Renderer::new(&mut device, &shaders, &scene, config.frame_width, config.frame_height)?;

        Ok(Self {
            device,
            scene,
            renderer,
            timer: Timer::new(),
            selection: SelectionState::default(),
        })
    }

    fn frame(&mut self) -> Result<(), AppError> {
        let delta_time = self.timer.advance(FIXED_DELTA);

        let frame = self.device.begin_frame()?;
        let (cmd, index) = (frame.command_buffer, frame.frame_index);
        self.scene.update(&mut self.device, delta_time)?;
        self.scene.sync(&mut self.device, cmd, index)?;
        self.renderer.render_raster_pass(&mut self.device, cmd, &self.scene, index)?;
        self.renderer.render_ray_trace_pass(&mut self.device, cmd, &self.scene, index)?;
        self.renderer.prepare_for_present(&mut self.device, cmd, OutputImage::RayTraced);
        self.device.end_frame(frame)?;
        Ok(())
    }

    /// Hover the centre pixel and select whatever is under it
    fn pick_centre(&mut self) -> Result<(), AppError> {
        let extent = self.renderer.extent();
        let picked = self
            .renderer
            .pick(&mut self.device, (extent.width / 2) as i32, (extent.height / 2) as i32)?;
        self.selection.hover(picked);
        self.selection.select_hovered();
        Ok(())
    }

    fn run(&mut self) -> Result<(), AppError> {
        for frame in 0..FRAME_COUNT {
            self.frame()?;
            if frame == FRAME_COUNT / 2 {
                self.pick_centre()?;
            }
        }
        Ok(())
    }

    fn shutdown(self) -> Result<usize, AppError> {
        let Self {
            mut device,
            scene,
            renderer,
            ..
        } = self;
        renderer.destroy(&mut device)?;
        scene.destroy(&mut device)?;
        Ok(device.live_object_count())
    }
}

fn print_summary(stats: &DeviceStats, timer: &Timer, selection: &SelectionState) {
    println!("Frames submitted:       {}", stats.frames_submitted);
    println!("Simulated time:         {:.2}s", timer.total_time());
    println!("TLAS builds / refits:   {} / {}", stats.tlas_builds, stats.tlas_refits);
    println!("BLAS builds:            {}", stats.blas_builds);
    println!("Single-time submits:    {}", stats.single_time_submits);
    println!("Descriptor writes:      {}", stats.descriptor_writes);
    println!("Layout mismatches:      {}", stats.layout_mismatches);
    println!("Stale descriptor binds: {}", stats.stale_descriptor_binds);
    if selection.has_selection() {
        println!("Selected instance:      {:?}", selection.selected());
    } else {
        println!("Selected instance:      none");
    }
}

fn load_config(path: Option<&String>) -> Result<EngineConfig, AppError> {
    let config = match path {
        Some(path) => {
            info!("Loading configuration from {}", path);
            EngineConfig::load_from_file(path)?
        }
        None => EngineConfig::headless(320, 180),
    };
    check_config(config)
}

fn check_config(config: EngineConfig) -> Result<EngineConfig, AppError> {
    config.validate()?;
    if !config.headless {
        return Err(AppError::NotHeadless);
    }
    Ok(config)
}

fn shader_library(config: &EngineConfig) -> Result<ShaderLibrary, AppError> {
    if config.shader_directory.is_dir() {
        return Ok(ShaderLibrary::load_directory(&config.shader_directory, REQUIRED_SHADERS)?);
    }
    info!(
        "No shader directory at {}, using stub modules",
        config.shader_directory.display()
    );
    Ok(ShaderLibrary::stub(REQUIRED_SHADERS))
}

fn run() -> Result<(), AppError> {
    let args: Vec<String> = std::env::args().collect();
    let scene_name = args.get(1).map_or("Island", String::as_str);
    let config = load_config(args.get(2))?;

    let mut app = IslandApp::new(&config, scene_name)?;
    let stopwatch = Stopwatch::start_new();
    app.run()?;
    info!("Recorded {} frames in {:.1} ms", FRAME_COUNT, stopwatch.elapsed_millis());

    print_summary(&app.device.stats(), &app.timer, &app.selection);
    let leaked = app.shutdown()?;
    if leaked > 0 {
        error!("{} device objects leaked at shutdown", leaked);
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Starting headless island demo");
    if let Err(e) = run() {
        error!("Demo failed: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybrid_engine::render::resources::SPIRV_MAGIC;
    use std::path::PathBuf;

    fn scratch_directory(name: &str) -> PathBuf {
        let directory = std::env::temp_dir().join(format!("island_app_{name}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&directory);
        directory
    }

    fn write_module(directory: &std::path::Path, name: &str) {
        let bytes: Vec<u8> = [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect();
        std::fs::write(directory.join(format!("{name}.spv")), bytes).unwrap();
    }

    #[test]
    fn test_windowed_config_is_rejected() {
        assert!(matches!(check_config(EngineConfig::default()), Err(AppError::NotHeadless)));
        assert!(check_config(EngineConfig::headless(64, 32)).is_ok());
    }

    #[test]
    fn test_invalid_config_is_rejected_before_headless_check() {
        let config = EngineConfig {
            frames_in_flight: 0,
            ..EngineConfig::headless(64, 32)
        };
        assert!(matches!(check_config(config), Err(AppError::Config(_))));
    }

    #[test]
    fn test_missing_shader_directory_uses_stubs() {
        let config = EngineConfig {
            shader_directory: scratch_directory("absent"),
            ..EngineConfig::headless(64, 32)
        };
        let library = shader_library(&config).unwrap();
        assert_eq!(library.len(), REQUIRED_SHADERS.len());
    }

    #[test]
    fn test_shader_directory_is_loaded_when_present() {
        let directory = scratch_directory("complete");
        std::fs::create_dir_all(&directory).unwrap();
        for name in REQUIRED_SHADERS {
            write_module(&directory, name);
        }
        let config = EngineConfig {
            shader_directory: directory.clone(),
            ..EngineConfig::headless(64, 32)
        };
        let library = shader_library(&config).unwrap();
        assert_eq!(library.len(), REQUIRED_SHADERS.len());
        std::fs::remove_dir_all(directory).unwrap();
    }

    #[test]
    fn test_incomplete_shader_directory_is_fatal() {
        let directory = scratch_directory("partial");
        std::fs::create_dir_all(&directory).unwrap();
        write_module(&directory, REQUIRED_SHADERS[0]);
        let config = EngineConfig {
            shader_directory: directory.clone(),
            ..EngineConfig::headless(64, 32)
        };
        let result = shader_library(&config);
        assert!(matches!(result, Err(AppError::Render(RenderError::MissingShader(_)))));
        std::fs::remove_dir_all(directory).unwrap();
    }
}
