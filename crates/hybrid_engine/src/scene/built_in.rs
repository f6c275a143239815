//! Built-in scenes
//!
//! Procedural stand-ins for authored content: every texture and mesh is
//! generated in code, since file decoding lives outside the engine.

use crate::assets::{MeshData, TextureData, TextureId};
use crate::foundation::logging::info;
use crate::foundation::math::{utils, Mat4, Vec2, Vec3};
use crate::render::api::RenderDevice;

use super::settings::EnvMapSettings;
use super::{Material, SceneError, SceneGraph};

/// Populates an empty scene
pub type SceneLoader = fn(&mut SceneGraph, &mut dyn RenderDevice) -> Result<(), SceneError>;

/// Built-in scenes by display name
pub fn built_in_scenes() -> Vec<(&'static str, SceneLoader)> {
    vec![("Island", load_island as SceneLoader), ("Cornell Box", load_cornell_box)]
}

/// Water detail-texture scroll velocity, in detail repeats per second before scaling
const WATER_SPEED: [f32; 2] = [0.3, 1.0];
const WATER_SCROLL_SCALE: f32 = 0.1;

fn sky_texture() -> TextureData {
    TextureData::from_fn(64, 32, |_, y| {
        let t = y as f32 / 31.0;
        let horizon = [0.85, 0.9, 1.0, 1.0];
        let zenith = [0.25, 0.45, 0.85, 1.0];
        std::array::from_fn(|c| zenith[c] + (horizon[c] - zenith[c]) * t)
    })
}

fn island_heights(resolution: u32) -> TextureData {
    TextureData::from_fn(resolution, resolution, |x, y| {
        let center = (resolution - 1) as f32 * 0.5;
        let dx = (x as f32 - center) / center;
        let dy = (y as f32 - center) / center;
        let r = (dx * dx + dy * dy).sqrt();
        let ripple = 0.05 * (dx * 9.0).sin() * (dy * 7.0).cos();
        let h = ((1.0 - r).max(0.0).powf(1.5) + ripple).max(0.0);
        [h, h, h, 1.0]
    })
}

fn checker(size: u32, a: [f32; 4], b: [f32; 4]) -> TextureData {
    TextureData::from_fn(size, size, |x, y| if (x / 4 + y / 4) % 2 == 0 { a } else { b })
}

/// Terrain island surrounded by animated water under a sky gradient
pub fn load_island(scene: &mut SceneGraph, device: &mut dyn RenderDevice) -> Result<(), SceneError> {
    let assets = scene.assets_mut();
    let sky = assets.load_texture(device, &sky_texture(), "Sky")?;
    let sand = assets.load_texture(device, &TextureData::solid(4, 4, [0.76, 0.7, 0.5, 1.0]), "Sand")?;
    let ripples = assets.load_texture(
        device,
        &TextureData::from_fn(32, 32, |x, y| {
            let v = 0.8 + 0.2 * ((x as f32 * 0.4).sin() * (y as f32 * 0.3).cos());
            [v, v, 1.0, 1.0]
        }),
        "Ripples",
    )?;
    let grain = assets.load_texture(device, &checker(16, [1.0; 4], [0.9, 0.9, 0.9, 1.0]), "Grain")?;
    let terrain = assets.load_mesh(device, &MeshData::heightmap(&island_heights(65), 40.0, 4.0), "Terrain")?;
    let water_mesh = assets.load_mesh(device, &MeshData::plane(200.0, 8), "Water")?;

    let island = scene.create_entity(device)?;
    scene.set_entity_mesh(island, terrain)?;
    scene.set_entity_textures(island, sand, grain)?;
    scene.set_entity_transform(island, Mat4::new_translation(&Vec3::new(0.0, -0.5, 0.0)))?;

    let water = scene.create_entity(device)?;
    scene.set_entity_mesh(water, water_mesh)?;
    scene.set_entity_textures(water, TextureId(0), ripples)?;
    scene.set_entity_material(
        water,
        Material {
            detail_scale_offset: [40.0, 40.0, 0.0, 0.0],
            ..Material::with_color([0.1, 0.35, 0.6, 1.0])
        },
    )?;

    scene.set_envmap_texture(sky);
    scene.set_envmap_settings(EnvMapSettings::new(0.0, 1.0, true));
    scene.camera_mut().set_position(Vec3::new(0.0, 6.0, 30.0));
    scene
        .camera_mut()
        .set_euler_angles(Vec3::new(utils::deg_to_rad(-10.0), 0.0, 0.0));

    let speed = Vec2::from(WATER_SPEED);
    scene.set_update_hook(move |scene, delta_time| {
        let _ = scene.modify_entity_material(water, |material| {
            let step = speed * delta_time * WATER_SCROLL_SCALE;
            material.detail_scale_offset[2] = utils::wrap(material.detail_scale_offset[2] + step.x, 1.0);
            material.detail_scale_offset[3] = utils::wrap(material.detail_scale_offset[3] + step.y, 1.0);
        });
    });
    info!("[SCENE] Loaded built-in scene 'Island'");
    Ok(())
}

/// Closed box with a red and a green wall, two blocks and an emissive ceiling panel
pub fn load_cornell_box(scene: &mut SceneGraph, device: &mut dyn RenderDevice) -> Result<(), SceneError> {
    let black = scene
        .assets_mut()
        .load_texture(device, &TextureData::solid(1, 1, [0.0, 0.0, 0.0, 1.0]), "Black")?;
    let cube = crate::assets::MeshId(0);

    // (translation, scale, rotation about Y, color)
    let pieces: [([f32; 3], [f32; 3], f32, [f32; 4]); 8] = [
        ([0.0, -0.05, 0.0], [2.1, 0.1, 2.1], 0.0, [0.73, 0.73, 0.73, 1.0]),
        ([0.0, 2.05, 0.0], [2.1, 0.1, 2.1], 0.0, [0.73, 0.73, 0.73, 1.0]),
        ([0.0, 1.0, -1.05], [2.1, 2.1, 0.1], 0.0, [0.73, 0.73, 0.73, 1.0]),
        ([-1.05, 1.0, 0.0], [0.1, 2.1, 2.1], 0.0, [0.65, 0.05, 0.05, 1.0]),
        ([1.05, 1.0, 0.0], [0.1, 2.1, 2.1], 0.0, [0.12, 0.45, 0.15, 1.0]),
        ([-0.35, 0.6, -0.3], [0.6, 1.2, 0.6], 0.3, [0.73, 0.73, 0.73, 1.0]),
        ([0.35, 0.3, 0.35], [0.6, 0.6, 0.6], -0.3, [0.73, 0.73, 0.73, 1.0]),
        ([0.0, 1.99, 0.0], [0.5, 0.02, 0.5], 0.0, [17.0, 12.0, 4.0, 1.0]),
    ];
    for (translation, scale, angle, color) in pieces {
        let id = scene.create_entity(device)?;
        let transform = Mat4::new_translation(&Vec3::from(translation))
            * Mat4::from_axis_angle(&Vec3::y_axis(), angle)
            * Mat4::new_nonuniform_scaling(&Vec3::from(scale));
        scene.set_entity_mesh(id, cube)?;
        scene.set_entity_transform(id, transform)?;
        scene.set_entity_material(id, Material::with_color(color))?;
    }

    scene.set_envmap_texture(black);
    scene.set_envmap_settings(EnvMapSettings::new(0.0, 0.0, false));
    scene.camera_mut().set_position(Vec3::new(0.0, 1.0, 3.8));
    scene.camera_mut().set_euler_angles(Vec3::zeros());
    info!("[SCENE] Loaded built-in scene 'Cornell Box'");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EngineConfig;
    use crate::render::backends::headless::HeadlessDevice;

    fn scene() -> (HeadlessDevice, SceneGraph) {
        let mut device = HeadlessDevice::new(2);
        let config = EngineConfig {
            max_entities: 16,
            ..EngineConfig::headless(32, 32)
        };
        let scene = SceneGraph::new(&mut device, &config).unwrap();
        (device, scene)
    }

    #[test]
    fn test_every_built_in_scene_loads() {
        for (name, load) in built_in_scenes() {
            let (mut device, mut scene) = scene();
            load(&mut scene, &mut device).unwrap_or_else(|e| panic!("{name}: {e}"));
            assert!(scene.entity_count() > 0, "{name} has no entities");
        }
    }

    #[test]
    fn test_water_offset_stays_in_unit_range() {
        let (mut device, mut scene) = scene();
        load_island(&mut scene, &mut device).unwrap();
        let water = scene.entity_ids()[1];
        for _ in 0..500 {
            let frame = device.begin_frame().unwrap();
            scene.update(&mut device, 0.37).unwrap();
            scene.sync(&mut device, frame.command_buffer, frame.frame_index).unwrap();
            device.end_frame(frame).unwrap();

            let offset = scene.get_entity_material(water).unwrap().detail_scale_offset;
            assert!((0.0..1.0).contains(&offset[2]), "{offset:?}");
            assert!((0.0..1.0).contains(&offset[3]), "{offset:?}");
        }
    }
}
