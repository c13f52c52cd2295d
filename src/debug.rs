//! Contains a debug resource and the systems controlling it.
use bevy::{
    prelude::*,
    render::{Extract, RenderApp},
};

/// Adds the terrain debug config and its keyboard controls.
pub struct TerrainDebugPlugin;

impl Plugin for TerrainDebugPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<DebugTerrain>()
            .add_systems(Update, toggle_debug);

        if let Some(render_app) = app.get_sub_app_mut(RenderApp) {
            render_app
                .init_resource::<DebugTerrain>()
                .add_systems(ExtractSchedule, extract_debug);
        }
    }
}

#[derive(Clone, Debug, Default, Resource)]
pub struct DebugTerrain {
    /// Keeps the chunk grid in place, regardless of the viewer's position.
    pub freeze: bool,
    /// Colors every chunk by its lod.
    pub show_lod: bool,
    /// Draws the terrain as lines. Requires the `POLYGON_MODE_LINE` wgpu feature.
    pub wireframe: bool,
}

pub fn extract_debug(mut debug: ResMut<DebugTerrain>, extracted_debug: Extract<Res<DebugTerrain>>) {
    *debug = extracted_debug.clone();
}

pub fn toggle_debug(input: Res<ButtonInput<KeyCode>>, mut debug: ResMut<DebugTerrain>) {
    if input.just_pressed(KeyCode::KeyF) {
        debug.freeze = !debug.freeze;
        println!(
            "{} the terrain grid.",
            if debug.freeze { "Froze" } else { "Unfroze" }
        )
    }
    if input.just_pressed(KeyCode::KeyL) {
        debug.show_lod = !debug.show_lod;
        println!(
            "Toggled the lod view {}.",
            if debug.show_lod { "on" } else { "off" }
        )
    }
    if input.just_pressed(KeyCode::KeyW) {
        debug.wireframe = !debug.wireframe;
        println!(
            "Toggled the wireframe view {}.",
            if debug.wireframe { "on" } else { "off" }
        )
    }
}
