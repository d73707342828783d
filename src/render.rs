mod backend;
mod device;
mod height_textures;
#[cfg(test)]
pub(crate) mod recording_device;
mod types;
mod wgpu_device;

pub use self::backend::{BackendState, CameraUniform, TerrainParamsUniform, TerrainRenderBackend};
pub use self::device::{free_if_valid, RenderDevice};
pub use self::height_textures::HeightTextures;
pub use self::types::*;
pub use self::wgpu_device::WgpuDevice;

use crate::error::{DeviceError, TerrainError};
use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;

pub(crate) const TERRAIN_VERTEX_WGSL: &str = include_str!("render/shaders/terrain_vertex.wgsl");
pub(crate) const TERRAIN_TESS_CONTROL_WGSL: &str = include_str!("render/shaders/terrain_tess_control.wgsl");
pub(crate) const TERRAIN_TESS_EVAL_WGSL: &str = include_str!("render/shaders/terrain_tess_eval.wgsl");
pub(crate) const TERRAIN_FRAGMENT_WGSL: &str = include_str!("render/shaders/terrain_fragment.wgsl");
pub(crate) const CAPTURE_WGSL: &str = include_str!("render/shaders/capture.wgsl");
pub(crate) const COMPOSITE_WGSL: &str = include_str!("render/shaders/composite.wgsl");
pub(crate) const PATCH_PRELUDE_WGSL: &str = include_str!("render/shaders/patch_prelude.wgsl");

/// Little-endian bytes of `value` repeated `count` times.
pub(crate) fn repeat_f32_bytes(value: f32, count: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(count * 4);
    for _ in 0..count {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}
