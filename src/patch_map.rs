use crate::error::TerrainError;
use std::path::Path;

/// Coarse single-channel summary of a displacement texture: each texel holds
/// the deepest press (0 = untouched, 255 = pressed to ground) within its
/// patch.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchMap {
    grid: usize,
    data: Vec<u8>,
}

fn displacement_byte(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

impl PatchMap {
    pub fn from_displacement(values: &[f32], size: usize, grid: usize) -> Result<Self, TerrainError> {
        if values.len() != size * size {
            return Err(TerrainError::Snapshot(format!(
                "expected {} displacement values, got {}",
                size * size,
                values.len()
            )));
        }
        if grid == 0 || grid > size {
            return Err(TerrainError::Snapshot(format!(
                "patch grid {} does not fit a {}x{} texture",
                grid, size, size
            )));
        }
        let mut data = vec![0u8; grid * grid];
        for py in 0..grid {
            let (y0, y1) = (py * size / grid, (py + 1) * size / grid);
            for px in 0..grid {
                let (x0, x1) = (px * size / grid, (px + 1) * size / grid);
                let deepest = (y0..y1)
                    .flat_map(|y| (x0..x1).map(move |x| y * size + x))
                    .map(|i| 255 - displacement_byte(values[i]))
                    .max()
                    .unwrap_or(0);
                data[py * grid + px] = deepest;
            }
        }
        Ok(Self { grid, data })
    }

    pub fn grid(&self) -> usize {
        self.grid
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.grid + x]
    }

    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<(), TerrainError> {
        let image = image::GrayImage::from_raw(self.grid as u32, self.grid as u32, self.data.clone())
            .ok_or_else(|| TerrainError::Snapshot("patch map buffer size mismatch".into()))?;
        image
            .save_with_format(path.as_ref(), image::ImageFormat::Png)
            .map_err(|e| TerrainError::Snapshot(e.to_string()))?;
        log::info!("wrote patch map snapshot to {}", path.as_ref().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_deepest_press_per_patch() {
        let size = 8;
        let mut values = vec![1.0f32; size * size];
        values[0] = 0.5;
        values[1] = 0.0;
        values[7 * size + 7] = 0.8;
        let map = PatchMap::from_displacement(&values, size, 2).unwrap();
        assert_eq!(map.get(0, 0), 255);
        assert_eq!(map.get(1, 0), 0);
        assert_eq!(map.get(0, 1), 0);
        assert_eq!(map.get(1, 1), 255 - 204);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(PatchMap::from_displacement(&[1.0; 10], 4, 2).is_err());
        assert!(PatchMap::from_displacement(&[1.0; 16], 4, 8).is_err());
    }

    #[test]
    fn saves_single_channel_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patches.png");
        let values: Vec<f32> = (0..64).map(|i| i as f32 / 63.0).collect();
        let map = PatchMap::from_displacement(&values, 8, 4).unwrap();
        map.save_png(&path).unwrap();

        let loaded = image::open(&path).unwrap();
        assert_eq!(loaded.color(), image::ColorType::L8);
        assert_eq!(loaded.to_luma8().into_raw(), map.data());
    }
}
