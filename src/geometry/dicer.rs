//! Recursively bounds, splits, and dices primitives into grids. The
//! worklist is a channel rather than a bare `VecDeque` so a caller can
//! later pull from it with more than one worker thread without changing
//! this module's shape — grids are independent once produced. No visited
//! set is needed: primitives never re-merge, they only ever split finer.

use cgmath::Matrix4;
use crossbeam_channel::{unbounded, Receiver, Sender};

use super::Geometry;
use crate::error::RenderError;
use crate::grid::Grid;

/// Default microgrid tile of 8x8 and a screen-space bound threshold of 8
/// units, the conventional REYES defaults.
#[derive(Debug, Clone, Copy)]
pub struct DicerConfig {
    pub screen_space_threshold: f32,
    pub microgrid_tile: usize,
}

impl Default for DicerConfig {
    fn default() -> Self {
        DicerConfig {
            screen_space_threshold: 8.0,
            microgrid_tile: 8,
        }
    }
}

enum Decision {
    Split,
    Dice(usize, usize),
    Fail,
}

fn decide(extent_x: f32, extent_y: f32, splittable: bool, diceable: bool, config: &DicerConfig) -> Decision {
    let screen_extent = (extent_x * extent_x + extent_y * extent_y).sqrt();
    let over_threshold = screen_extent > config.screen_space_threshold;
    if over_threshold {
        if splittable {
            Decision::Split
        } else if diceable {
            Decision::Dice(dice_resolution(extent_x, config.microgrid_tile), dice_resolution(extent_y, config.microgrid_tile))
        } else {
            Decision::Fail
        }
    } else if diceable {
        Decision::Dice(dice_resolution(extent_x, config.microgrid_tile), dice_resolution(extent_y, config.microgrid_tile))
    } else if splittable {
        Decision::Split
    } else {
        Decision::Fail
    }
}

/// Resolution proportional to the screen-space extent, rounded up to a
/// multiple of the microgrid tile, always at least one tile's worth of
/// vertices.
fn dice_resolution(extent: f32, tile: usize) -> usize {
    let tile = tile.max(1);
    let samples = extent.max(1.0).ceil() as usize;
    let rounded = samples.div_ceil(tile) * tile;
    rounded.max(tile) + 1
}

/// Dices `geometry` (under `transform`) into a set of grids, recursively
/// splitting any sub-primitive whose screen-space bound exceeds
/// `config.screen_space_threshold`. A pure function of its inputs.
pub fn dice_all(geometry: Geometry, transform: Matrix4<f32>, config: &DicerConfig) -> Result<Vec<Grid>, RenderError> {
    let (tx, rx): (Sender<Geometry>, Receiver<Geometry>) = unbounded();
    tx.send(geometry).expect("receiver outlives every send in this single-pass worklist");

    let mut grids = Vec::new();
    while let Ok(primitive) = rx.try_recv() {
        if !primitive.boundable() {
            return Err(RenderError::UnsupportedGeometry {
                message: "primitive is not boundable".into(),
            });
        }
        let (min, max) = primitive.bound(&transform)?;
        let extent_x = max.x - min.x;
        let extent_y = max.y - min.y;

        match decide(extent_x, extent_y, primitive.splittable(), primitive.diceable(), config) {
            Decision::Split => {
                log::trace!("dicer: splitting primitive (extent {extent_x:.3}x{extent_y:.3})");
                for child in primitive.split() {
                    tx.send(child).expect("receiver outlives every send in this single-pass worklist");
                }
            }
            Decision::Dice(width, height) => {
                log::trace!("dicer: dicing primitive at {width}x{height} (extent {extent_x:.3}x{extent_y:.3})");
                grids.push(primitive.dice(&transform, width, height)?);
            }
            Decision::Fail => {
                return Err(RenderError::UnsupportedGeometry {
                    message: "primitive not diceable".into(),
                });
            }
        }
    }
    Ok(grids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Cylinder;
    use cgmath::SquareMatrix;
    use proptest::prelude::*;

    #[test]
    fn small_primitive_dices_directly_without_splitting() {
        let geometry = Geometry::cylinder(Cylinder::new(1.0, 0.0, 1.0, std::f32::consts::TAU));
        let config = DicerConfig {
            screen_space_threshold: 1000.0,
            ..Default::default()
        };
        let grids = dice_all(geometry, Matrix4::identity(), &config).unwrap();
        assert_eq!(grids.len(), 1);
    }

    #[test]
    fn large_primitive_is_recursively_split_into_several_grids() {
        let geometry = Geometry::cylinder(Cylinder::new(50.0, 0.0, 1.0, std::f32::consts::TAU));
        let config = DicerConfig {
            screen_space_threshold: 8.0,
            microgrid_tile: 8,
        };
        let grids = dice_all(geometry, Matrix4::identity(), &config).unwrap();
        assert!(grids.len() > 1);
        for grid in &grids {
            assert!(grid.has("P"));
        }
    }

    #[test]
    fn dice_resolution_rounds_up_to_microgrid_tile_multiples() {
        assert_eq!(dice_resolution(3.0, 8), 9);
        assert_eq!(dice_resolution(8.0, 8), 9);
        assert_eq!(dice_resolution(9.0, 8), 17);
    }

    proptest! {
        #[test]
        fn dice_resolution_is_always_one_past_a_tile_multiple(
            extent in 0.01f32..2000.0,
            tile in 1usize..32,
        ) {
            let resolution = dice_resolution(extent, tile);
            prop_assert!(resolution > tile);
            prop_assert_eq!((resolution - 1) % tile, 0);
        }

        #[test]
        fn dice_resolution_grows_monotonically_with_extent(
            small in 0.01f32..100.0,
            delta in 0.01f32..100.0,
            tile in 1usize..32,
        ) {
            let large = small + delta;
            prop_assert!(dice_resolution(large, tile) >= dice_resolution(small, tile));
        }
    }
}
