//! The in-memory data model shared by the encoder and the decoder: the
//! header-derived per-component parameters, tile/resolution/sub-band/
//! precinct/code-block geometry, and the routines that build that geometry
//! from a [`Header`].
//!
//! Marker-segment byte layout lives in [`crate::codestream`]; this module
//! only deals with the derived, already-parsed shape of an image.

use crate::rect::IntRect;
use crate::tag_tree::{TagNode, TagTree};
use std::ops::Range;

/// The wavelet filter pair a component is transformed with: the 5/3
/// reversible filter (lossless-capable) or the 9/7 irreversible one.
/// Exposed publicly since [`crate::encoder::EncoderConfig`] lets a caller
/// choose it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaveletTransform {
    Reversible53,
    Irreversible97,
}

/// One of the five packet orderings Annex A.6.1 allows, chosen by
/// [`crate::encoder::EncoderConfig`] and followed by both the packet writer
/// and reader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressionOrder {
    LayerResolutionComponentPosition,
    ResolutionLayerComponentPosition,
    ResolutionPositionComponentLayer,
    PositionComponentResolutionLayer,
    ComponentPositionResolutionLayer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QuantizationStyle {
    NoQuantization,
    ScalarDerived,
    ScalarExpounded,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct QuantizationInfo {
    pub(crate) quantization_style: QuantizationStyle,
    pub(crate) guard_bits: u8,
    /// `(exponent, mantissa)` per sub-band, in the order the QCD/QCC marker
    /// lists them (nLL, then nHL/nLH/nHH per decomposition level).
    pub(crate) step_sizes: Vec<(u8, u16)>,
}

impl Default for QuantizationStyle {
    fn default() -> Self {
        QuantizationStyle::NoQuantization
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct CodeBlockStyle {
    pub(crate) selective_arithmetic_coding_bypass: bool,
    pub(crate) reset_context_probabilities: bool,
    pub(crate) termination_on_each_pass: bool,
    pub(crate) vertically_causal_context: bool,
    pub(crate) predictable_termination: bool,
    pub(crate) segmentation_symbols: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct CodingStyleFlags {
    pub(crate) uses_precincts: bool,
    pub(crate) uses_sop_markers: bool,
    pub(crate) uses_eph_markers: bool,
}

impl CodingStyleFlags {
    pub(crate) fn may_use_sop_markers(&self) -> bool {
        self.uses_sop_markers
    }

    pub(crate) fn uses_eph_marker(&self) -> bool {
        self.uses_eph_markers
    }
}

#[derive(Clone, Debug)]
pub(crate) struct CodingStyleParameters {
    pub(crate) num_decomposition_levels: u8,
    pub(crate) num_resolution_levels: u8,
    pub(crate) code_block_width: u8,
    pub(crate) code_block_height: u8,
    pub(crate) code_block_style: CodeBlockStyle,
    pub(crate) transformation: WaveletTransform,
    /// `(PPx, PPy)` per resolution level; empty when precincts aren't used
    /// (the implicit default of 15/15 applies).
    pub(crate) precinct_exponents: Vec<(u8, u8)>,
}

#[derive(Clone, Debug)]
pub(crate) struct CodingStyleComponent {
    pub(crate) flags: CodingStyleFlags,
    pub(crate) parameters: CodingStyleParameters,
}

#[derive(Clone, Debug)]
pub(crate) struct CodingStyleDefault {
    pub(crate) progression_order: ProgressionOrder,
    pub(crate) num_layers: u16,
    pub(crate) mct: bool,
    pub(crate) component_parameters: CodingStyleComponent,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ComponentSizeInfo {
    pub(crate) precision: u8,
    pub(crate) is_signed: bool,
    pub(crate) horizontal_resolution: u8,
    pub(crate) vertical_resolution: u8,
}

#[derive(Clone, Debug)]
pub(crate) struct ComponentInfo {
    pub(crate) size_info: ComponentSizeInfo,
    pub(crate) coding_style: CodingStyleComponent,
    pub(crate) quantization_info: QuantizationInfo,
}

impl ComponentInfo {
    pub(crate) fn num_resolution_levels(&self) -> u16 {
        self.coding_style.parameters.num_resolution_levels as u16
    }

    pub(crate) fn wavelet_transform(&self) -> WaveletTransform {
        self.coding_style.parameters.transformation
    }

    pub(crate) fn code_block_style(&self) -> &CodeBlockStyle {
        &self.coding_style.parameters.code_block_style
    }

    /// Returns the `(exponent, mantissa)` pair for the given sub-band at the
    /// given resolution level, per the layout of Table A.24/A.26.
    pub(crate) fn exponent_mantissa(
        &self,
        sub_band_type: SubBandType,
        resolution: u16,
    ) -> (u16, u16) {
        let step_sizes = &self.quantization_info.step_sizes;

        let idx = if resolution == 0 {
            0
        } else {
            // Three sub-bands per decomposition level beyond the nLL band.
            let decomposition_level = resolution - 1;
            let offset = match sub_band_type {
                SubBandType::HighLow => 0,
                SubBandType::LowHigh => 1,
                SubBandType::HighHigh => 2,
                SubBandType::LowLow => unreachable!("LL only exists at resolution 0"),
            };
            1 + decomposition_level as usize * 3 + offset
        };

        let entry = step_sizes.get(idx).copied().unwrap_or((0, 0));
        (entry.0 as u16, entry.1)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct SizeData {
    pub(crate) reference_grid_width: u32,
    pub(crate) reference_grid_height: u32,
    pub(crate) image_area_x_offset: u32,
    pub(crate) image_area_y_offset: u32,
    pub(crate) tile_width: u32,
    pub(crate) tile_height: u32,
    pub(crate) tile_x_offset: u32,
    pub(crate) tile_y_offset: u32,
    pub(crate) component_sizes: Vec<ComponentSizeInfo>,
}

impl SizeData {
    pub(crate) fn image_width(&self) -> u32 {
        self.reference_grid_width - self.image_area_x_offset
    }

    pub(crate) fn image_height(&self) -> u32 {
        self.reference_grid_height - self.image_area_y_offset
    }

    pub(crate) fn num_x_tiles(&self) -> u32 {
        (self.reference_grid_width - self.tile_x_offset).div_ceil(self.tile_width)
    }

    pub(crate) fn num_y_tiles(&self) -> u32 {
        (self.reference_grid_height - self.tile_y_offset).div_ceil(self.tile_height)
    }

    pub(crate) fn num_tiles(&self) -> u32 {
        self.num_x_tiles() * self.num_y_tiles()
    }

    pub(crate) fn tile_x_coord(&self, idx: u32) -> u32 {
        idx % self.num_x_tiles()
    }

    pub(crate) fn tile_y_coord(&self, idx: u32) -> u32 {
        idx / self.num_x_tiles()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Header {
    pub(crate) size_data: SizeData,
    pub(crate) global_coding_style: CodingStyleDefault,
    pub(crate) component_infos: Vec<ComponentInfo>,
}

/// A single tile of the image, with the component parameters it is subject
/// to (usually inherited from the main header, occasionally overridden per
/// tile-part).
#[derive(Clone, Debug)]
pub(crate) struct Tile {
    pub(crate) idx: u32,
    pub(crate) component_infos: Vec<ComponentInfo>,
    pub(crate) rect: IntRect,
    pub(crate) progression_order: ProgressionOrder,
    pub(crate) num_layers: u16,
    pub(crate) mct: bool,
}

impl Tile {
    pub(crate) fn new(idx: u32, header: &Header) -> Tile {
        let rect = {
            let size_data = &header.size_data;

            let x_coord = size_data.tile_x_coord(idx);
            let y_coord = size_data.tile_y_coord(idx);

            let x0 = u32::max(
                size_data.tile_x_offset + x_coord * size_data.tile_width,
                size_data.image_area_x_offset,
            );
            let y0 = u32::max(
                size_data.tile_y_offset + y_coord * size_data.tile_height,
                size_data.image_area_y_offset,
            );

            let x1 = u32::min(
                size_data.tile_x_offset + (x_coord + 1) * size_data.tile_width,
                size_data.reference_grid_width,
            );
            let y1 = u32::min(
                size_data.tile_y_offset + (y_coord + 1) * size_data.tile_height,
                size_data.reference_grid_height,
            );

            IntRect::from_ltrb(x0, y0, x1, y1)
        };

        Tile {
            idx,
            component_infos: header.component_infos.clone(),
            rect,
            progression_order: header.global_coding_style.progression_order,
            mct: header.global_coding_style.mct,
            num_layers: header.global_coding_style.num_layers,
        }
    }

    pub(crate) fn component_tiles(&self) -> impl Iterator<Item = ComponentTile<'_>> {
        self.component_infos
            .iter()
            .map(|i| ComponentTile::new(self, i))
    }
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct ComponentTile<'a> {
    pub(crate) tile: &'a Tile,
    pub(crate) component_info: &'a ComponentInfo,
    pub(crate) rect: IntRect,
}

impl<'a> ComponentTile<'a> {
    pub(crate) fn new(tile: &'a Tile, component_info: &'a ComponentInfo) -> Self {
        let tile_rect = tile.rect;

        let rect = if component_info.size_info.horizontal_resolution == 1
            && component_info.size_info.vertical_resolution == 1
        {
            tile_rect
        } else {
            let t_x0 = tile_rect
                .x0
                .div_ceil(component_info.size_info.horizontal_resolution as u32);
            let t_y0 = tile_rect
                .y0
                .div_ceil(component_info.size_info.vertical_resolution as u32);
            let t_x1 = tile_rect
                .x1
                .div_ceil(component_info.size_info.horizontal_resolution as u32);
            let t_y1 = tile_rect
                .y1
                .div_ceil(component_info.size_info.vertical_resolution as u32);

            IntRect::from_ltrb(t_x0, t_y0, t_x1, t_y1)
        };

        ComponentTile {
            tile,
            component_info,
            rect,
        }
    }

    pub(crate) fn resolution_tiles(&self) -> impl Iterator<Item = ResolutionTile<'_>> {
        (0..self
            .component_info
            .coding_style
            .parameters
            .num_resolution_levels)
            .map(|r| ResolutionTile::new(*self, r as u16))
    }
}

pub(crate) struct ResolutionTile<'a> {
    pub(crate) resolution: u16,
    pub(crate) decomposition_level: u16,
    pub(crate) component_tile: ComponentTile<'a>,
    pub(crate) rect: IntRect,
}

impl<'a> ResolutionTile<'a> {
    pub(crate) fn new(component_tile: ComponentTile<'a>, resolution: u16) -> ResolutionTile<'a> {
        let rect = {
            let n_l = component_tile
                .component_info
                .coding_style
                .parameters
                .num_decomposition_levels;

            let shift = n_l as u32 - resolution as u32;
            let tx0 = component_tile.rect.x0.div_ceil(2u32.pow(shift));
            let ty0 = component_tile.rect.y0.div_ceil(2u32.pow(shift));
            let tx1 = component_tile.rect.x1.div_ceil(2u32.pow(shift));
            let ty1 = component_tile.rect.y1.div_ceil(2u32.pow(shift));

            IntRect::from_ltrb(tx0, ty0, tx1, ty1)
        };

        let decomposition_level = if resolution == 0 {
            component_tile
                .component_info
                .coding_style
                .parameters
                .num_decomposition_levels
        } else {
            component_tile
                .component_info
                .coding_style
                .parameters
                .num_decomposition_levels
                - (resolution - 1)
        };

        ResolutionTile {
            resolution,
            decomposition_level,
            component_tile,
            rect,
        }
    }

    pub(crate) fn sub_band_rect(&self, sub_band_type: SubBandType) -> IntRect {
        let xo_b = if matches!(sub_band_type, SubBandType::HighLow | SubBandType::HighHigh) {
            1
        } else {
            0
        };
        let yo_b = if matches!(sub_band_type, SubBandType::LowHigh | SubBandType::HighHigh) {
            1
        } else {
            0
        };

        let numerator_x = 2u32.pow(self.decomposition_level as u32 - 1) * xo_b;
        let numerator_y = 2u32.pow(self.decomposition_level as u32 - 1) * yo_b;
        let denominator = 2u32.pow(self.decomposition_level as u32);

        let tbx_0 = self
            .component_tile
            .rect
            .x0
            .saturating_sub(numerator_x)
            .div_ceil(denominator);
        let tbx_1 = self
            .component_tile
            .rect
            .x1
            .saturating_sub(numerator_x)
            .div_ceil(denominator);
        let tby_0 = self
            .component_tile
            .rect
            .y0
            .saturating_sub(numerator_y)
            .div_ceil(denominator);
        let tby_1 = self
            .component_tile
            .rect
            .y1
            .saturating_sub(numerator_y)
            .div_ceil(denominator);

        IntRect::from_ltrb(tbx_0, tby_0, tbx_1, tby_1)
    }

    pub(crate) fn precinct_exponent_x(&self) -> u8 {
        self.component_tile
            .component_info
            .coding_style
            .parameters
            .precinct_exponents
            .get(self.resolution as usize)
            .copied()
            .unwrap_or((15, 15))
            .0
    }

    pub(crate) fn precinct_exponent_y(&self) -> u8 {
        self.component_tile
            .component_info
            .coding_style
            .parameters
            .precinct_exponents
            .get(self.resolution as usize)
            .copied()
            .unwrap_or((15, 15))
            .1
    }

    pub(crate) fn num_precincts_x(&self) -> u32 {
        let IntRect { x0, x1, .. } = self.rect;
        if x0 == x1 {
            0
        } else {
            x1.div_ceil(2u32.pow(self.precinct_exponent_x() as u32))
                - x0 / 2u32.pow(self.precinct_exponent_x() as u32)
        }
    }

    pub(crate) fn num_precincts_y(&self) -> u32 {
        let IntRect { y0, y1, .. } = self.rect;
        if y0 == y1 {
            0
        } else {
            y1.div_ceil(2u32.pow(self.precinct_exponent_y() as u32))
                - y0 / 2u32.pow(self.precinct_exponent_y() as u32)
        }
    }

    pub(crate) fn num_precincts(&self) -> u32 {
        self.num_precincts_x() * self.num_precincts_y()
    }

    pub(crate) fn code_block_width(&self) -> u32 {
        let xcb = self
            .component_tile
            .component_info
            .coding_style
            .parameters
            .code_block_width;

        let xcb = if self.resolution > 0 {
            u8::min(xcb, self.precinct_exponent_x().saturating_sub(1))
        } else {
            u8::min(xcb, self.precinct_exponent_x())
        };

        2u32.pow(xcb as u32)
    }

    pub(crate) fn code_block_height(&self) -> u32 {
        let ycb = self
            .component_tile
            .component_info
            .coding_style
            .parameters
            .code_block_height;

        let ycb = if self.resolution > 0 {
            u8::min(ycb, self.precinct_exponent_y().saturating_sub(1))
        } else {
            u8::min(ycb, self.precinct_exponent_y())
        };

        2u32.pow(ycb as u32)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SubBandType {
    LowLow,
    LowHigh,
    HighLow,
    HighHigh,
}

pub(crate) struct Decomposition {
    /// In the order high-low, low-high, high-high.
    pub(crate) sub_bands: [usize; 3],
    pub(crate) rect: IntRect,
}

#[derive(Clone)]
pub(crate) struct SubBand {
    pub(crate) sub_band_type: SubBandType,
    pub(crate) rect: IntRect,
    pub(crate) precincts: Range<usize>,
    pub(crate) coefficients: Vec<f32>,
}

#[derive(Clone)]
pub(crate) struct Precinct {
    pub(crate) code_blocks: Range<usize>,
    pub(crate) code_inclusion_tree: TagTree,
    pub(crate) zero_bitplane_tree: TagTree,
}

#[derive(Clone)]
pub(crate) struct CodeBlock {
    pub(crate) rect: IntRect,
    pub(crate) x_idx: u32,
    pub(crate) y_idx: u32,
    pub(crate) layers: Range<usize>,
    pub(crate) has_been_included: bool,
    pub(crate) missing_bit_planes: u8,
    pub(crate) number_of_coding_passes: u32,
    pub(crate) l_block: u32,
    pub(crate) non_empty_layer_count: u32,
}

pub(crate) struct Segment<'a> {
    pub(crate) idx: u32,
    pub(crate) coding_passes: u32,
    pub(crate) data_length: u32,
    pub(crate) data: &'a [u8],
}

#[derive(Clone)]
pub(crate) struct Layer {
    pub(crate) segments: Option<Range<usize>>,
}

/// Arena-style storage for the geometry of a single tile, reused across
/// tiles to amortize allocations. Shared by the encoder and the decoder.
#[derive(Default)]
pub(crate) struct TileGeometry<'a> {
    pub(crate) segments: Vec<Segment<'a>>,
    pub(crate) layers: Vec<Layer>,
    pub(crate) code_blocks: Vec<CodeBlock>,
    pub(crate) precincts: Vec<Precinct>,
    pub(crate) sub_bands: Vec<SubBand>,
    pub(crate) decompositions: Vec<Decomposition>,
    pub(crate) tag_nodes: Vec<TagNode>,
    pub(crate) component_decompositions: Vec<ComponentDecompositions>,
}

/// The decomposition range and nLL sub-band index for a single component
/// within a [`TileGeometry`].
#[derive(Clone)]
pub(crate) struct ComponentDecompositions {
    pub(crate) first_ll_sub_band: usize,
    pub(crate) decompositions: Range<usize>,
}

impl ComponentDecompositions {
    pub(crate) fn sub_band_iter(
        &self,
        resolution: u16,
        decompositions: &[Decomposition],
    ) -> SubBandIter {
        let indices = if resolution == 0 {
            [
                self.first_ll_sub_band,
                self.first_ll_sub_band,
                self.first_ll_sub_band,
            ]
        } else {
            decompositions[self.decompositions.clone()][resolution as usize - 1].sub_bands
        };

        SubBandIter {
            next_idx: 0,
            indices,
            resolution,
        }
    }
}

#[derive(Clone)]
pub(crate) struct SubBandIter {
    resolution: u16,
    next_idx: usize,
    indices: [usize; 3],
}

impl Iterator for SubBandIter {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let value = if self.resolution == 0 {
            if self.next_idx > 0 {
                None
            } else {
                Some(self.indices[0])
            }
        } else if self.next_idx >= self.indices.len() {
            None
        } else {
            Some(self.indices[self.next_idx])
        };

        self.next_idx += 1;
        value
    }
}

impl<'a> TileGeometry<'a> {
    pub(crate) fn reset(&mut self) {
        self.segments.clear();
        self.layers.clear();
        self.code_blocks.clear();
        self.precincts.clear();
        self.sub_bands.clear();
        self.decompositions.clear();
        self.tag_nodes.clear();
        self.component_decompositions.clear();
    }

    /// Builds the decomposition/sub-band/precinct/code-block tree for every
    /// component of `tile`. Shared between encode (coefficients populated
    /// from the forward DWT) and decode (coefficients populated from Tier-1).
    pub(crate) fn build(&mut self, tile: &Tile) {
        for (component_idx, component_tile) in tile.component_tiles().enumerate() {
            let mut ll_sub_band = None;
            let start = self.decompositions.len();

            for resolution_tile in component_tile.resolution_tiles() {
                let resolution = resolution_tile.resolution;

                if resolution == 0 {
                    let sub_band_rect = resolution_tile.sub_band_rect(SubBandType::LowLow);
                    let precincts = self.build_precincts(
                        &resolution_tile,
                        sub_band_rect,
                        tile.num_layers,
                    );

                    ll_sub_band = Some(SubBand {
                        sub_band_type: SubBandType::LowLow,
                        rect: sub_band_rect,
                        precincts,
                        coefficients: vec![
                            0.0;
                            (sub_band_rect.width() * sub_band_rect.height()) as usize
                        ],
                    });
                } else {
                    let mut build_one = |kind: SubBandType, this: &mut Self| {
                        let sub_band_rect = resolution_tile.sub_band_rect(kind);
                        let precincts =
                            this.build_precincts(&resolution_tile, sub_band_rect, tile.num_layers);

                        let idx = this.sub_bands.len();
                        this.sub_bands.push(SubBand {
                            sub_band_type: kind,
                            rect: sub_band_rect,
                            precincts,
                            coefficients: vec![
                                0.0;
                                (sub_band_rect.width() * sub_band_rect.height()) as usize
                            ],
                        });
                        idx
                    };

                    let decomposition = Decomposition {
                        sub_bands: [
                            build_one(SubBandType::HighLow, self),
                            build_one(SubBandType::LowHigh, self),
                            build_one(SubBandType::HighHigh, self),
                        ],
                        rect: resolution_tile.rect,
                    };

                    self.decompositions.push(decomposition);
                }
                let _ = component_idx;
            }

            let end = self.decompositions.len();
            let first_ll_sub_band = self.sub_bands.len();
            self.sub_bands.push(ll_sub_band.expect("resolution 0 always builds an LL band"));

            self.component_decompositions.push(ComponentDecompositions {
                decompositions: start..end,
                first_ll_sub_band,
            });
        }
    }

    fn build_precincts(
        &mut self,
        resolution_tile: &ResolutionTile,
        sub_band_rect: IntRect,
        num_layers: u16,
    ) -> Range<usize> {
        let num_precincts_y = resolution_tile.num_precincts_y();
        let num_precincts_x = resolution_tile.num_precincts_x();

        let mut ppx = resolution_tile.precinct_exponent_x();
        let mut ppy = resolution_tile.precinct_exponent_y();

        let mut y_start = (resolution_tile.rect.y0 / (1 << ppy)) * (1 << ppy);
        let mut x_start = (resolution_tile.rect.x0 / (1 << ppx)) * (1 << ppx);

        if resolution_tile.resolution > 0 {
            ppx -= 1;
            ppy -= 1;
            x_start /= 2;
            y_start /= 2;
        }

        let ppx_pow2 = 1 << ppx;
        let ppy_pow2 = 1 << ppy;

        let start = self.precincts.len();

        let mut y0 = y_start;
        for _y in 0..num_precincts_y {
            let mut x0 = x_start;

            for _x in 0..num_precincts_x {
                let precinct_rect = IntRect::from_xywh(x0, y0, ppx_pow2, ppy_pow2);

                let cb_width = resolution_tile.code_block_width();
                let cb_height = resolution_tile.code_block_height();

                let cb_x0 = (u32::max(precinct_rect.x0, sub_band_rect.x0) / cb_width) * cb_width;
                let cb_y0 = (u32::max(precinct_rect.y0, sub_band_rect.y0) / cb_height) * cb_height;

                let code_block_area = IntRect::from_ltrb(
                    cb_x0,
                    cb_y0,
                    u32::min(precinct_rect.x1, sub_band_rect.x1),
                    u32::min(precinct_rect.y1, sub_band_rect.y1),
                );

                let code_blocks_x = if sub_band_rect.width() == 0 {
                    0
                } else {
                    code_block_area.width().div_ceil(cb_width)
                };
                let code_blocks_y = if sub_band_rect.height() == 0 {
                    0
                } else {
                    code_block_area.height().div_ceil(cb_height)
                };

                let blocks = self.build_code_blocks(
                    code_block_area,
                    sub_band_rect,
                    resolution_tile,
                    code_blocks_x,
                    code_blocks_y,
                    num_layers,
                );

                let code_inclusion_tree =
                    TagTree::new(code_blocks_x, code_blocks_y, &mut self.tag_nodes);
                let zero_bitplane_tree =
                    TagTree::new(code_blocks_x, code_blocks_y, &mut self.tag_nodes);

                self.precincts.push(Precinct {
                    code_blocks: blocks,
                    code_inclusion_tree,
                    zero_bitplane_tree,
                });

                x0 += ppx_pow2;
            }

            y0 += ppy_pow2;
        }

        start..self.precincts.len()
    }

    fn build_code_blocks(
        &mut self,
        code_block_area: IntRect,
        sub_band_rect: IntRect,
        resolution_tile: &ResolutionTile,
        code_blocks_x: u32,
        code_blocks_y: u32,
        num_layers: u16,
    ) -> Range<usize> {
        let code_block_width = resolution_tile.code_block_width();
        let code_block_height = resolution_tile.code_block_height();

        let start = self.code_blocks.len();

        let mut y = code_block_area.y0;
        for y_idx in 0..code_blocks_y {
            let mut x = code_block_area.x0;

            for x_idx in 0..code_blocks_x {
                let area = IntRect::from_xywh(x, y, code_block_width, code_block_height)
                    .intersect(sub_band_rect);

                let layer_start = self.layers.len();
                self.layers
                    .extend(std::iter::repeat_n(Layer { segments: None }, num_layers as usize));
                let layer_end = self.layers.len();

                self.code_blocks.push(CodeBlock {
                    x_idx,
                    y_idx,
                    rect: area,
                    has_been_included: false,
                    missing_bit_planes: 0,
                    l_block: 3,
                    number_of_coding_passes: 0,
                    layers: layer_start..layer_end,
                    non_empty_layer_count: 0,
                });

                x += code_block_width;
            }

            y += code_block_height;
        }

        start..self.code_blocks.len()
    }
}
