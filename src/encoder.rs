//! Top-level encode pipeline, the mirror of `decoder.rs`: level-shift ->
//! forward MCT -> forward DWT -> scalar quantize -> Tier-1 bit-plane code ->
//! PCRD-opt rate allocation -> Tier-2 packet assembly -> codestream framing.
//! Generalizes the teacher's per-tile driver from its read-only direction to
//! the algebraic inverse of each stage, built from the specification since
//! the teacher never encodes.
//!
//! This encoder always uses normal-mode code-block coding (no selective
//! bypass, no per-pass termination): every code-block's bit-planes come out
//! of [`tier1::encode`] as one continuous MQ stream, and rate control works
//! by choosing byte-offset truncation points into that single stream rather
//! than re-encoding anything, the same technique real PCRD-opt encoders use.

use crate::bit_writer::BitWriter;
use crate::byte_reader::Writer;
use crate::codestream::{self, TilePartBody};
use crate::decoder::{Image, Plane};
use crate::dwt::{self, LevelGeometry};
use crate::error::{J2kError, Result};
use crate::image::{
    CodeBlockStyle, CodingStyleComponent, CodingStyleDefault, CodingStyleFlags,
    CodingStyleParameters, ComponentInfo, ComponentSizeInfo, ComponentTile, Header,
    ProgressionOrder, QuantizationInfo, QuantizationStyle, SizeData, SubBandIter, SubBandType,
    Tile, TileGeometry, WaveletTransform,
};
use crate::mct;
use crate::pcrd::{self, HullPoint, PassPoint};
use crate::progression;
use crate::quant;
use crate::tier1::{self, CodeBlockSource, EncodedCodeBlock};
use crate::tier2::{self, WriteContribution};

/// Guard bits (Annex E.1's `G`), fixed rather than exposed on
/// [`EncoderConfig`]: two bits above the coded MSB is the informal Part 1
/// default and what `hayro`'s own dequantization comments assume.
const GUARD_BITS: u8 = 2;

/// Parameters for [`encode`]. One setting applies uniformly to every
/// component and every tile; per-component overrides (COC/QCC) are a
/// decode-side concept this encoder never needs to emit.
pub struct EncoderConfig {
    pub transform: WaveletTransform,
    pub num_decomposition_levels: u8,
    pub num_layers: u16,
    pub progression_order: ProgressionOrder,
    /// `xcb`/`ycb` exponents (actual code-block size is `2^n`), Table A.19.
    pub code_block_width: u8,
    pub code_block_height: u8,
    pub mct: bool,
    /// `None` tiles the whole image as a single tile.
    pub tile_width: Option<u32>,
    pub tile_height: Option<u32>,
    /// One byte budget per layer, in ascending order; `None` takes every
    /// remaining coding pass (only sensible for the final layer).
    pub layer_budgets: Vec<Option<u32>>,
    /// PCRD-opt's bisection tolerance, a fraction of each layer's budget.
    pub tolerance: f64,
}

impl EncoderConfig {
    fn validate(&self, image: &Image) -> Result<()> {
        if image.components.is_empty() {
            return Err(J2kError::InvalidParameter { message: "image has no components" });
        }

        for plane in &image.components {
            if plane.samples.len() != (image.width * image.height) as usize {
                return Err(J2kError::InvalidParameter {
                    message: "plane sample count does not match image width * height",
                });
            }
        }

        if self.mct && image.components.len() != 3 {
            return Err(J2kError::InvalidParameter { message: "MCT requires exactly three components" });
        }

        // `codestream::write_header` emits a single QCD shared by every
        // component (no per-component QCC overrides), so every component's
        // derived step-size table must agree, which only holds when they
        // share a bit depth.
        if let Some(first) = image.components.first() {
            if image.components.iter().any(|plane| plane.precision != first.precision) {
                return Err(J2kError::InvalidParameter { message: "all components must share the same precision" });
            }
        }

        if !(2..=10).contains(&self.code_block_width) || !(2..=10).contains(&self.code_block_height) {
            return Err(J2kError::InvalidParameter { message: "code-block exponent must be in 2..=10" });
        }

        // Table A.19: xcb + ycb <= 12.
        if self.code_block_width as u32 + self.code_block_height as u32 > 12 {
            return Err(J2kError::InvalidParameter { message: "code-block area exponent exceeds 12" });
        }

        if self.num_layers == 0 {
            return Err(J2kError::InvalidParameter { message: "at least one quality layer is required" });
        }

        if self.layer_budgets.len() != self.num_layers as usize {
            return Err(J2kError::InvalidParameter { message: "layer_budgets length must equal num_layers" });
        }

        Ok(())
    }
}

/// Encodes `image` into a complete codestream (`SOC` ... `EOC`), one
/// tile-part per tile, following `config`.
pub fn encode(image: &Image, config: &EncoderConfig) -> Result<Vec<u8>> {
    config.validate(image)?;

    let header = build_header(image, config);
    let mut writer = Writer::new();
    codestream::write_header(&mut writer, &header, &[]);

    let mut geometry = TileGeometry::default();
    for tile_idx in 0..header.size_data.num_tiles() {
        geometry.reset();
        let tile = Tile::new(tile_idx, &header);
        let packet_bytes = encode_tile(image, &tile, config, &mut geometry);

        codestream::write_tile_part(
            &mut writer,
            &TilePartBody { tile_index: tile_idx as u16, tile_part_index: 0, num_tile_parts: 1, packet_bytes },
        );
    }

    codestream::write_eoc(&mut writer);
    Ok(writer.into_bytes())
}

fn build_header(image: &Image, config: &EncoderConfig) -> Header {
    let tile_width = config.tile_width.unwrap_or(image.width);
    let tile_height = config.tile_height.unwrap_or(image.height);

    let component_sizes: Vec<ComponentSizeInfo> = image
        .components
        .iter()
        .map(|plane| ComponentSizeInfo {
            precision: plane.precision,
            is_signed: plane.signed,
            horizontal_resolution: plane.horizontal_resolution,
            vertical_resolution: plane.vertical_resolution,
        })
        .collect();

    let size_data = SizeData {
        reference_grid_width: image.width,
        reference_grid_height: image.height,
        image_area_x_offset: 0,
        image_area_y_offset: 0,
        tile_width,
        tile_height,
        tile_x_offset: 0,
        tile_y_offset: 0,
        component_sizes: component_sizes.clone(),
    };

    let parameters = CodingStyleParameters {
        num_decomposition_levels: config.num_decomposition_levels,
        num_resolution_levels: config.num_decomposition_levels + 1,
        code_block_width: config.code_block_width,
        code_block_height: config.code_block_height,
        code_block_style: CodeBlockStyle::default(),
        transformation: config.transform,
        precinct_exponents: vec![],
    };

    let component_parameters = CodingStyleComponent { flags: CodingStyleFlags::default(), parameters };

    let global_coding_style = CodingStyleDefault {
        progression_order: config.progression_order,
        num_layers: config.num_layers,
        mct: config.mct,
        component_parameters: component_parameters.clone(),
    };

    let component_infos = component_sizes
        .into_iter()
        .map(|size_info| {
            let placeholder =
                ComponentInfo { size_info, coding_style: component_parameters.clone(), quantization_info: QuantizationInfo::default() };
            let step_sizes = sub_band_step_sizes(&placeholder, config.num_decomposition_levels);

            ComponentInfo {
                quantization_info: QuantizationInfo {
                    quantization_style: QuantizationStyle::NoQuantization,
                    guard_bits: GUARD_BITS,
                    step_sizes,
                },
                ..placeholder
            }
        })
        .collect();

    Header { size_data, global_coding_style, component_infos }
}

/// One `(exponent, 0)` entry per sub-band, in QCD order: nLL, then HL/LH/HH
/// per decomposition level from coarsest to finest. This encoder never
/// targets a distortion-weighted step size (the informative tuning Annex
/// E.1 allows); it quantizes at step size 1 (`NoQuantization`, the exponent-
/// only form of Equation E-5) and leaves all rate control to PCRD-opt
/// truncation, which is what `pcrd.rs` is for.
fn sub_band_step_sizes(component_info: &ComponentInfo, num_decomposition_levels: u8) -> Vec<(u8, u16)> {
    let mut step_sizes = vec![(quant::dynamic_range(component_info, SubBandType::LowLow) as u8, 0u16)];

    for _ in 0..num_decomposition_levels {
        for sub_band_type in [SubBandType::HighLow, SubBandType::LowHigh, SubBandType::HighHigh] {
            step_sizes.push((quant::dynamic_range(component_info, sub_band_type) as u8, 0u16));
        }
    }

    step_sizes
}

fn encode_tile(image: &Image, tile: &Tile, config: &EncoderConfig, geometry: &mut TileGeometry) -> Vec<u8> {
    geometry.build(tile);

    let component_tiles: Vec<ComponentTile> = tile.component_tiles().collect();
    let mut component_samples: Vec<Vec<f32>> = component_tiles
        .iter()
        .zip(&image.components)
        .map(|(component_tile, plane)| gather_tile_samples(image, component_tile, plane))
        .collect();

    if tile.mct {
        if let [a, b, c] = &mut component_samples[..] {
            let transform = tile.component_infos[0].wavelet_transform();
            mct::forward(transform, &mut [a.as_mut_slice(), b.as_mut_slice(), c.as_mut_slice()]);
        }
    }

    let mut quantized: Vec<Vec<i32>> = vec![Vec::new(); geometry.sub_bands.len()];

    for (component_idx, component_tile) in component_tiles.iter().enumerate() {
        let decomp = geometry.component_decompositions[component_idx].clone();
        let component_info = &tile.component_infos[component_idx];
        let transform = component_info.wavelet_transform();

        let levels: Vec<LevelGeometry> = geometry.decompositions[decomp.decompositions.clone()]
            .iter()
            .map(|d| LevelGeometry {
                rect: d.rect,
                hl_rect: geometry.sub_bands[d.sub_bands[0]].rect,
                lh_rect: geometry.sub_bands[d.sub_bands[1]].rect,
                hh_rect: geometry.sub_bands[d.sub_bands[2]].rect,
            })
            .collect();

        let bit_depth = component_info.size_info.precision;
        let (ll, bands) = dwt::forward_apply(&component_samples[component_idx], component_tile.rect, &levels, transform, bit_depth);

        let delta_ll = quant::step_size(component_info, SubBandType::LowLow, 0);
        quantized[decomp.first_ll_sub_band] = ll.iter().map(|&v| quant::quantize(v, delta_ll)).collect();

        for (level_idx, decomposition) in geometry.decompositions[decomp.decompositions.clone()].iter().enumerate() {
            let resolution = level_idx as u16 + 1;
            let (hl, lh, hh) = &bands[level_idx];

            for (sub_band_type, values, sub_band_idx) in [
                (SubBandType::HighLow, hl, decomposition.sub_bands[0]),
                (SubBandType::LowHigh, lh, decomposition.sub_bands[1]),
                (SubBandType::HighHigh, hh, decomposition.sub_bands[2]),
            ] {
                let delta = quant::step_size(component_info, sub_band_type, resolution);
                quantized[sub_band_idx] = values.iter().map(|&v| quant::quantize(v, delta)).collect();
            }
        }
    }

    let (encoded_blocks, hulls) = encode_all_code_blocks(tile, geometry, &quantized);
    let layer_choices = pcrd::allocate_layers(&hulls, &config.layer_budgets, config.tolerance);

    write_tile_packets(tile, geometry, &encoded_blocks, &hulls, &layer_choices)
}

/// Reads one component's samples for `component_tile`'s (possibly
/// sub-sampled) rect out of the image-wide plane, undoing the DC level
/// shift [`crate::decoder::decode`] applies on the way out (Annex G.1).
/// Mirrors `compose_tile` in reverse: every sub-sampled position takes the
/// single representative grid sample `compose_tile` would have replicated
/// from it.
fn gather_tile_samples(image: &Image, component_tile: &ComponentTile, plane: &Plane) -> Vec<f32> {
    let scale_x = plane.horizontal_resolution as u32;
    let scale_y = plane.vertical_resolution as u32;
    let rect = component_tile.rect;

    let shift = if plane.signed { 0.0 } else { (1u32 << (plane.precision - 1)) as f32 };

    let mut samples = Vec::with_capacity((rect.width() * rect.height()) as usize);
    for y in rect.y0..rect.y1 {
        let grid_y = (y * scale_y).min(image.height.saturating_sub(1));
        for x in rect.x0..rect.x1 {
            let grid_x = (x * scale_x).min(image.width.saturating_sub(1));
            let value = plane.samples[(grid_y * image.width + grid_x) as usize] as f32;
            samples.push(value - shift);
        }
    }

    samples
}

/// Encodes every code-block of every sub-band of every component, in the
/// same (component, resolution, sub-band, precinct, code-block) nesting
/// [`crate::decoder::decode_bitplanes`] walks -- which is also the order
/// [`TileGeometry::build`] pushed them in, so the result lines up index-for-
/// index with `geometry.code_blocks`.
fn encode_all_code_blocks(tile: &Tile, geometry: &TileGeometry, quantized: &[Vec<i32>]) -> (Vec<EncodedCodeBlock>, Vec<Vec<HullPoint>>) {
    let mut encoded_blocks = Vec::with_capacity(geometry.code_blocks.len());
    let mut hulls = Vec::with_capacity(geometry.code_blocks.len());

    for (component_idx, component_info) in tile.component_infos.iter().enumerate() {
        for resolution in 0..component_info.num_resolution_levels() {
            let decomp = geometry.component_decompositions[component_idx].clone();
            let sub_band_iter = decomp.sub_band_iter(resolution, &geometry.decompositions);

            for sub_band_idx in sub_band_iter {
                encode_sub_band(sub_band_idx, resolution, component_info, geometry, quantized, &mut encoded_blocks, &mut hulls);
            }
        }
    }

    (encoded_blocks, hulls)
}

fn encode_sub_band(
    sub_band_idx: usize,
    resolution: u16,
    component_info: &ComponentInfo,
    geometry: &TileGeometry,
    quantized: &[Vec<i32>],
    encoded_blocks: &mut Vec<EncodedCodeBlock>,
    hulls: &mut Vec<Vec<HullPoint>>,
) {
    let sub_band = &geometry.sub_bands[sub_band_idx];
    let sub_band_type = sub_band.sub_band_type;
    let num_bitplanes = quant::num_bitplanes(component_info, sub_band_type, resolution) as u8;
    let style = component_info.code_block_style();
    let sub_band_width = sub_band.rect.width() as usize;
    let values = &quantized[sub_band_idx];

    for precinct_idx in sub_band.precincts.clone() {
        let code_block_range = geometry.precincts[precinct_idx].code_blocks.clone();

        for code_block in &geometry.code_blocks[code_block_range] {
            let width = code_block.rect.width();
            let height = code_block.rect.height();
            let x_offset = (code_block.rect.x0 - sub_band.rect.x0) as usize;
            let y_offset = (code_block.rect.y0 - sub_band.rect.y0) as usize;

            let mut block_values = Vec::with_capacity((width * height) as usize);
            for y in 0..height as usize {
                let row_start = (y_offset + y) * sub_band_width + x_offset;
                block_values.extend_from_slice(&values[row_start..row_start + width as usize]);
            }

            let source = CodeBlockSource { values: &block_values, width, height };
            let encoded = tier1::encode(&source, sub_band_type, num_bitplanes, style);
            hulls.push(build_hull(&encoded));
            encoded_blocks.push(encoded);
        }
    }
}

/// Turns one code-block's pass/byte checkpoints into PCRD-opt candidate
/// points. There's no true per-pass distortion measurement here (that would
/// need the original, unquantized coefficients kept around per block); the
/// standard proxy is used instead -- a coded bit-plane's contribution to
/// squared error roughly halves every plane, so weight each pass by `4^plane`
/// and accumulate. This keeps the curve's marginal slope non-increasing,
/// which is all [`pcrd::convex_hull`] needs from it.
fn build_hull(encoded: &EncodedCodeBlock) -> Vec<HullPoint> {
    let mut points = vec![PassPoint { coding_passes: 0, cumulative_bytes: 0, cumulative_distortion: 0.0 }];

    if encoded.number_of_coding_passes > 0 {
        // Inverse of `passes = 3 * planes - 2`.
        let planes_coded = (encoded.number_of_coding_passes + 2) / 3;
        let top_bitplane = planes_coded.saturating_sub(1) as u8;
        let mut cumulative_distortion = 0.0f64;

        for pass in 0..encoded.number_of_coding_passes {
            let plane = top_bitplane.saturating_sub((pass / 3) as u8);
            cumulative_distortion += 4f64.powi(plane as i32);
            points.push(PassPoint {
                coding_passes: pass + 1,
                cumulative_bytes: encoded.pass_byte_lengths[pass as usize],
                cumulative_distortion,
            });
        }
    }

    pcrd::convex_hull(&points)
}

/// Builds the `WriteContribution`s one packet (one sub-band iterator at one
/// precinct) needs: every code-block whose PCRD-chosen cumulative pass count
/// grew between the previous layer and this one, sliced out of its single
/// continuous normal-mode MQ stream by byte offset.
fn collect_contributions<'a>(
    sub_band_iter: SubBandIter,
    precinct_idx: u32,
    geometry: &TileGeometry,
    encoded_blocks: &'a [EncodedCodeBlock],
    cumulative_passes: &[u32],
    prev_cumulative_passes: &[u32],
) -> Vec<WriteContribution<'a>> {
    let mut contributions = Vec::new();

    for sub_band_idx in sub_band_iter {
        let precinct_range = geometry.sub_bands[sub_band_idx].precincts.clone();
        let code_block_range = geometry.precincts[precinct_range][precinct_idx as usize].code_blocks.clone();

        for code_block_idx in code_block_range {
            let prev_passes = prev_cumulative_passes[code_block_idx];
            let new_passes = cumulative_passes[code_block_idx];
            if new_passes <= prev_passes {
                continue;
            }

            let encoded = &encoded_blocks[code_block_idx];
            let prev_offset = if prev_passes == 0 { 0 } else { encoded.pass_byte_lengths[prev_passes as usize - 1] as usize };
            let new_offset = if new_passes == encoded.number_of_coding_passes {
                encoded.segments[0].len()
            } else {
                encoded.pass_byte_lengths[new_passes as usize - 1] as usize
            };

            contributions.push(WriteContribution {
                code_block_idx,
                added_coding_passes: new_passes - prev_passes,
                segment_bytes: vec![&encoded.segments[0][prev_offset..new_offset]],
            });
        }
    }

    contributions
}

/// Writes every packet of the tile, in progression order, mirroring
/// [`tier2::read_packets`] in reverse.
fn write_tile_packets(
    tile: &Tile,
    geometry: &mut TileGeometry,
    encoded_blocks: &[EncodedCodeBlock],
    hulls: &[Vec<HullPoint>],
    layer_choices: &[Vec<usize>],
) -> Vec<u8> {
    let num_blocks = encoded_blocks.len();
    let cumulative_passes: Vec<Vec<u32>> = layer_choices
        .iter()
        .map(|choice| choice.iter().zip(hulls).map(|(&idx, hull)| hull[idx].coding_passes).collect())
        .collect();
    let zero_cumulative = vec![0u32; num_blocks];

    let sequence = progression::build_packet_sequence(tile, &[]);
    let mut packet_bytes = Vec::new();

    for packet in &sequence {
        let prev_cumulative: &[u32] =
            if packet.layer_num == 0 { &zero_cumulative } else { &cumulative_passes[packet.layer_num as usize - 1] };

        let decomp = geometry.component_decompositions[packet.component as usize].clone();
        let sub_band_iter = decomp.sub_band_iter(packet.resolution, &geometry.decompositions);
        let component_info = &tile.component_infos[packet.component as usize];

        let contributions = collect_contributions(
            sub_band_iter.clone(),
            packet.precinct,
            geometry,
            encoded_blocks,
            &cumulative_passes[packet.layer_num as usize],
            prev_cumulative,
        );

        let mut bit_writer = BitWriter::new();
        let body =
            tier2::write_packet_header(sub_band_iter, packet.precinct, packet.layer_num as u32, component_info, &contributions, geometry, &mut bit_writer);

        packet_bytes.extend(bit_writer.finish());
        packet_bytes.extend(body);
    }

    packet_bytes
}
