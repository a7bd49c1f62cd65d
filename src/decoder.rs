//! Top-level decode pipeline: parse the codestream, then for each tile walk
//! packets -> bit-plane decode -> inverse DWT -> inverse MCT -> compose into
//! the image's per-component planar output. Mirrors the teacher's
//! `decode()`/`decode_tile()` driver (`TileDecodeContext`, the six-step
//! per-tile sequence), generalized from its JP2/`Bitmap` output to this
//! crate's planar [`Image`] and rewired to this crate's own entropy/packet/
//! DWT/MCT modules.

use crate::codestream::{self, ParsedTile};
use crate::dwt::{self, LevelGeometry};
use crate::error::{J2kError, Result};
use crate::image::{ComponentInfo, Header, Tile, TileGeometry};
use crate::mct;
use crate::progression;
use crate::quant;
use crate::rect::IntRect;
use crate::tier1::{self, BitPlaneDecodeBuffers};
use crate::tier2;

/// Best-effort tolerance for tile-level errors, §7's "decode best effort"
/// opt-in: a tile that fails to decode is left as an all-zero reconstruction
/// and the error is collected as a warning instead of aborting the whole
/// image.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeSettings {
    pub best_effort: bool,
}

/// One component's reconstructed samples, already DC-shifted back to the
/// component's native signed/unsigned range.
#[derive(Debug, Clone)]
pub struct Plane {
    pub samples: Vec<i32>,
    pub precision: u8,
    pub signed: bool,
    pub horizontal_resolution: u8,
    pub vertical_resolution: u8,
}

/// A fully decoded image: planar per-component samples at the reference
/// grid's full resolution (sub-sampled components are already replicated up
/// to the grid, matching the teacher's `store`).
#[derive(Debug, Clone)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub components: Vec<Plane>,
}

/// A tile that errored during decode, kept as a warning instead of aborting
/// when [`DecodeSettings::best_effort`] is set.
#[derive(Debug)]
pub struct TileWarning {
    pub tile_idx: u32,
    pub error: J2kError,
}

pub fn decode(data: &[u8], settings: &DecodeSettings) -> Result<(Image, Vec<TileWarning>)> {
    let (header, tiles) = codestream::read(data)?;

    let plane_len = (header.size_data.image_width() * header.size_data.image_height()) as usize;
    let mut channels: Vec<Vec<f32>> = header.component_infos.iter().map(|_| vec![0.0f32; plane_len]).collect();

    let mut geometry = TileGeometry::default();
    let mut warnings = Vec::new();

    for parsed in &tiles {
        geometry.reset();

        match decode_tile(&header, parsed, &mut geometry) {
            Ok(outputs) => compose_tile(&header, &parsed.tile, outputs, &mut channels),
            Err(err) if settings.best_effort => warnings.push(TileWarning { tile_idx: parsed.tile.idx, error: err }),
            Err(err) => return Err(err),
        }
    }

    let components = header
        .component_infos
        .iter()
        .zip(channels)
        .map(|(info, samples)| to_plane(info, samples))
        .collect();

    Ok((
        Image {
            width: header.size_data.image_width(),
            height: header.size_data.image_height(),
            components,
        },
        warnings,
    ))
}

fn to_plane(info: &ComponentInfo, samples: Vec<f32>) -> Plane {
    let max = (1i64 << info.size_info.precision) - 1;
    let samples = samples
        .into_iter()
        .map(|value| {
            let rounded = value.round() as i64;
            if info.size_info.is_signed {
                rounded.clamp(-(max + 1) / 2, max / 2) as i32
            } else {
                rounded.clamp(0, max) as i32
            }
        })
        .collect();

    Plane {
        samples,
        precision: info.size_info.precision,
        signed: info.size_info.is_signed,
        horizontal_resolution: info.size_info.horizontal_resolution,
        vertical_resolution: info.size_info.vertical_resolution,
    }
}

/// One component's reconstructed, DC-shifted samples at its own (possibly
/// sub-sampled) resolution, together with the rect they cover.
struct ComponentOutput {
    coefficients: Vec<f32>,
    rect: IntRect,
}

fn decode_tile<'a>(header: &Header, parsed: &ParsedTile<'a>, geometry: &mut TileGeometry<'a>) -> Result<Vec<ComponentOutput>> {
    geometry.build(&parsed.tile);

    let sequence = progression::build_packet_sequence(&parsed.tile, &parsed.poc_entries);

    for tile_part in &parsed.tile_parts {
        let packets = sequence.iter().map(|p| {
            let decomp = &geometry.component_decompositions[p.component as usize];
            let sub_band_iter = decomp.sub_band_iter(p.resolution, &geometry.decompositions);
            (sub_band_iter, p.precinct, p.layer_num as u32, p.component)
        });

        tier2::read_packets(tile_part, packets, &parsed.tile.component_infos, geometry)
            .ok_or_else(|| J2kError::corrupt(0, "packet stream ended before the expected number of packets"))?;
    }

    decode_bitplanes(&parsed.tile, geometry)?;

    let mut outputs = Vec::with_capacity(parsed.tile.component_infos.len());
    for (component_idx, component_tile) in parsed.tile.component_tiles().enumerate() {
        let decomp = geometry.component_decompositions[component_idx].clone();
        let ll = &geometry.sub_bands[decomp.first_ll_sub_band];

        let levels: Vec<LevelGeometry> = geometry.decompositions[decomp.decompositions.clone()]
            .iter()
            .map(|d| LevelGeometry {
                rect: d.rect,
                hl_rect: geometry.sub_bands[d.sub_bands[0]].rect,
                lh_rect: geometry.sub_bands[d.sub_bands[1]].rect,
                hh_rect: geometry.sub_bands[d.sub_bands[2]].rect,
            })
            .collect();

        let bands: Vec<(Vec<f32>, Vec<f32>, Vec<f32>)> = geometry.decompositions[decomp.decompositions.clone()]
            .iter()
            .map(|d| {
                (
                    geometry.sub_bands[d.sub_bands[0]].coefficients.clone(),
                    geometry.sub_bands[d.sub_bands[1]].coefficients.clone(),
                    geometry.sub_bands[d.sub_bands[2]].coefficients.clone(),
                )
            })
            .collect();

        let transform = component_tile.component_info.wavelet_transform();
        let bit_depth = component_tile.component_info.size_info.precision;
        let buffer = dwt::inverse_apply(&ll.coefficients, ll.rect, &levels, &bands, transform, bit_depth);

        outputs.push(ComponentOutput { coefficients: buffer.coefficients, rect: buffer.rect });
    }

    if parsed.tile.mct {
        if let [a, b, c] = &mut outputs[..] {
            let transform = parsed.tile.component_infos[0].wavelet_transform();
            mct::inverse(transform, &mut [&mut a.coefficients, &mut b.coefficients, &mut c.coefficients]);
        }
    }

    for (output, component_info) in outputs.iter_mut().zip(parsed.tile.component_infos.iter()) {
        if !component_info.size_info.is_signed {
            let shift = (1u32 << (component_info.size_info.precision - 1)) as f32;
            for sample in &mut output.coefficients {
                *sample += shift;
            }
        }
    }

    Ok(outputs)
}

fn decode_bitplanes(tile: &Tile, geometry: &mut TileGeometry) -> Result<()> {
    let mut bp_buffers = BitPlaneDecodeBuffers::default();

    for (component_idx, component_info) in tile.component_infos.iter().enumerate() {
        for resolution in 0..component_info.num_resolution_levels() {
            let decomp = geometry.component_decompositions[component_idx].clone();
            let sub_band_iter = decomp.sub_band_iter(resolution, &geometry.decompositions);

            for sub_band_idx in sub_band_iter {
                decode_sub_band(sub_band_idx, resolution, component_info, &mut bp_buffers, geometry)?;
            }
        }
    }

    Ok(())
}

fn decode_sub_band(
    sub_band_idx: usize,
    resolution: u16,
    component_info: &ComponentInfo,
    bp_buffers: &mut BitPlaneDecodeBuffers,
    geometry: &mut TileGeometry,
) -> Result<()> {
    let sub_band_type = geometry.sub_bands[sub_band_idx].sub_band_type;
    let delta_b = quant::step_size(component_info, sub_band_type, resolution);
    let num_bitplanes = quant::num_bitplanes(component_info, sub_band_type, resolution);
    let style = component_info.code_block_style().clone();

    let precinct_range = geometry.sub_bands[sub_band_idx].precincts.clone();

    for precinct_idx in precinct_range {
        let code_block_range = geometry.precincts[precinct_idx].code_blocks.clone();

        for code_block_idx in code_block_range {
            let code_block = geometry.code_blocks[code_block_idx].clone();

            let result = tier1::decode(
                &code_block,
                sub_band_type,
                num_bitplanes as u8,
                &style,
                bp_buffers,
                &geometry.layers[code_block.layers.clone()],
                &geometry.segments,
            )
            .map_err(|reason| J2kError::corrupt(0, reason))?;

            let sub_band = &mut geometry.sub_bands[sub_band_idx];
            let x_offset = code_block.rect.x0 - sub_band.rect.x0;
            let y_offset = code_block.rect.y0 - sub_band.rect.y0;
            let width = code_block.rect.width() as usize;

            for (idx, value) in result.coefficients().enumerate() {
                let x = idx % width;
                let y = idx / width;
                let out_idx = (y_offset as usize + y) * sub_band.rect.width() as usize + x_offset as usize + x;
                sub_band.coefficients[out_idx] = quant::dequantize(value, delta_b);
            }
        }
    }

    Ok(())
}

/// Scatters each tile's reconstructed, per-component coefficients into the
/// image-wide planar buffers, replicating sub-sampled components up to the
/// reference grid (B.2) and skipping any part of a boundary tile that falls
/// outside the image area (the `image_area_x/y_offset` crop). Mirrors the
/// teacher's `store`, generalized to every sub-sampling ratio instead of
/// special-casing 1:1.
fn compose_tile(header: &Header, tile: &Tile, outputs: Vec<ComponentOutput>, channels: &mut [Vec<f32>]) {
    let image_x_offset = header.size_data.image_area_x_offset;
    let image_y_offset = header.size_data.image_area_y_offset;
    let image_width = header.size_data.image_width();
    let image_height = header.size_data.image_height();

    for ((output, component_info), container) in outputs.into_iter().zip(tile.component_infos.iter()).zip(channels.iter_mut()) {
        let scale_x = component_info.size_info.horizontal_resolution as u32;
        let scale_y = component_info.size_info.vertical_resolution as u32;
        let rect = output.rect;

        for y in rect.y0..rect.y1 {
            let relative_y = (y - rect.y0) as usize;
            let grid_y0 = scale_y * y;

            for x in rect.x0..rect.x1 {
                let relative_x = (x - rect.x0) as usize;
                let grid_x0 = scale_x * x;

                let sample = output.coefficients[relative_y * rect.width() as usize + relative_x];

                for grid_y in grid_y0..u32::min(grid_y0 + scale_y, image_y_offset + image_height) {
                    if grid_y < image_y_offset {
                        continue;
                    }
                    let row = (grid_y - image_y_offset) as usize;

                    for grid_x in grid_x0..u32::min(grid_x0 + scale_x, image_x_offset + image_width) {
                        if grid_x < image_x_offset {
                            continue;
                        }
                        let col = (grid_x - image_x_offset) as usize;
                        container[row * image_width as usize + col] = sample;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{self, EncoderConfig};
    use crate::image::{ProgressionOrder, WaveletTransform};

    fn gradient_image(width: u32, height: u32) -> Image {
        let samples = (0..width * height)
            .map(|i| {
                let x = i % width;
                let y = i / width;
                ((7 * x + 3 * y) % 256) as i32
            })
            .collect();

        Image {
            width,
            height,
            components: vec![Plane { samples, precision: 8, signed: false, horizontal_resolution: 1, vertical_resolution: 1 }],
        }
    }

    #[test]
    fn lossless_round_trip_small_gradient() {
        let image = gradient_image(8, 8);
        let config = EncoderConfig {
            transform: WaveletTransform::Reversible53,
            num_decomposition_levels: 1,
            num_layers: 1,
            progression_order: ProgressionOrder::LayerResolutionComponentPosition,
            code_block_width: 6,
            code_block_height: 6,
            mct: false,
            tile_width: None,
            tile_height: None,
            layer_budgets: vec![None],
            tolerance: 0.005,
        };

        let encoded = encoder::encode(&image, &config).expect("encode should succeed");
        let (decoded, warnings) = decode(&encoded, &DecodeSettings::default()).expect("decode should succeed");

        assert!(warnings.is_empty());
        assert_eq!(decoded.width, image.width);
        assert_eq!(decoded.height, image.height);
        assert_eq!(decoded.components[0].samples, image.components[0].samples);
    }

    #[test]
    fn missing_eoc_surfaces_as_error() {
        let mut data = b"\xFF\x4F".to_vec();
        data.extend_from_slice(&[0u8; 4]);
        let err = decode(&data, &DecodeSettings::default()).unwrap_err();
        assert!(matches!(err, J2kError::MissingMarker { .. } | J2kError::TruncatedCodestream { .. }));
    }
}
