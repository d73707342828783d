use super::*;
use crate::heightmap::{HeightmapBank, HeightmapBuffer};
use crate::terrain::{HeightTextureRef, TerrainStreamer};

/// GPU mirror of the heightmap bank: one mipmapped R32Float texture per slot,
/// re-uploaded whenever the slot's generation moves on.
pub struct HeightTextures {
    textures: Vec<Rid>,
    uploaded: Vec<u64>,
}

fn level_bytes(level: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice(level).to_vec()
}

fn slot_desc(buffer: &HeightmapBuffer) -> TextureDesc {
    let size = buffer.resolution() as u32;
    TextureDesc::new_2d(
        size,
        size,
        TextureFormat::R32Float,
        TextureUsage::SAMPLING | TextureUsage::CAN_UPDATE | TextureUsage::CAN_COPY_FROM,
    )
    .with_mipmaps(buffer.mip_count() as u32)
}

impl HeightTextures {
    pub fn new(device: &mut dyn RenderDevice, bank: &HeightmapBank) -> Result<Self, TerrainError> {
        let mut textures = Vec::with_capacity(bank.slots().len());
        for buffer in bank.slots() {
            let data: Vec<Vec<u8>> = buffer.levels().map(|(_, level)| level_bytes(level)).collect();
            match device.texture_create(&slot_desc(buffer), &data) {
                Ok(rid) => textures.push(rid),
                Err(err) => {
                    for rid in textures {
                        free_if_valid(device, rid);
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(Self {
            uploaded: bank.slots().iter().map(|b| b.generation()).collect(),
            textures,
        })
    }

    /// Uploads every slot rewritten since the last sync. Called each frame,
    /// so a regenerated slot reaches the GPU while it is still settling.
    pub fn sync(&mut self, device: &mut dyn RenderDevice, bank: &HeightmapBank) -> Result<usize, TerrainError> {
        let mut count = 0;
        for (slot, buffer) in bank.slots().iter().enumerate() {
            if self.uploaded[slot] == buffer.generation() {
                continue;
            }
            for (mip, (_, level)) in buffer.levels().enumerate() {
                device.texture_update(self.textures[slot], mip as u32, bytemuck::cast_slice(level))?;
            }
            self.uploaded[slot] = buffer.generation();
            log::debug!("uploaded heightmap slot {} ({} mips)", slot, buffer.mip_count());
            count += 1;
        }
        Ok(count)
    }

    pub fn texture(&self, slot: usize) -> Rid {
        self.textures[slot]
    }

    /// Texture bound for the published slot and the origin its UVs are
    /// relative to.
    pub fn height_texture(&self, terrain: &TerrainStreamer) -> (Rid, HeightTextureRef) {
        let height = terrain.height_texture();
        (self.textures[height.slot], height)
    }

    pub fn free(&mut self, device: &mut dyn RenderDevice) {
        for rid in self.textures.drain(..) {
            free_if_valid(device, rid);
        }
        self.uploaded.clear();
    }
}
