use bevy::{asset::embedded_asset, prelude::*};
use itertools::Itertools;

pub const HEIGHT_KERNEL_SHADER: &str = "embedded://bevy_lod_terrain/shaders/height_kernel.wgsl";
pub const TERRAIN_SHADER: &str = "embedded://bevy_lod_terrain/shaders/terrain.wgsl";
pub const INSTANCED_MODEL_SHADER: &str =
    "embedded://bevy_lod_terrain/shaders/instanced_model.wgsl";

/// Keeps the import-only shaders loaded.
#[derive(Default, Resource)]
pub(crate) struct InternalShaders(Vec<Handle<Shader>>);

impl InternalShaders {
    pub(crate) fn load(app: &mut App, shaders: &[&'static str]) {
        let mut shaders = shaders
            .iter()
            .map(|&shader| app.world_mut().resource_mut::<AssetServer>().load(shader))
            .collect_vec();

        let mut internal_shaders = app.world_mut().resource_mut::<InternalShaders>();
        internal_shaders.0.append(&mut shaders);
    }
}

pub(crate) fn load_terrain_shaders(app: &mut App) {
    embedded_asset!(app, "types.wgsl");
    embedded_asset!(app, "noise.wgsl");
    embedded_asset!(app, "height_kernel.wgsl");
    embedded_asset!(app, "terrain.wgsl");
    embedded_asset!(app, "instanced_model.wgsl");

    app.init_resource::<InternalShaders>();

    InternalShaders::load(
        app,
        &[
            "embedded://bevy_lod_terrain/shaders/types.wgsl",
            "embedded://bevy_lod_terrain/shaders/noise.wgsl",
        ],
    );
}
