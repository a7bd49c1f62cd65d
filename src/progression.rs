//! Progression order sequencing, Annex A.6.1/B.12, plus the POC
//! (progression order change) override of Annex A.9.1.
//!
//! A progression order is one of five ways to nest four loops over
//! (layer, resolution, component, precinct); the packets of a well-formed
//! codestream are laid out in exactly the sequence the corresponding loop
//! nesting visits. The same sequence drives both directions: the writer
//! emits packets in this order, the reader expects them in this order.

use crate::image::{ComponentTile, ProgressionOrder, ResolutionTile, Tile};

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ProgressionData {
    pub(crate) layer_num: u16,
    pub(crate) resolution: u16,
    pub(crate) component: u16,
    pub(crate) precinct: u32,
}

/// One POC marker entry (Table A.17): a replacement progression order for
/// packets whose (resolution, component) address falls in
/// `[0, resolution_end) x [0, component_end)` starting at
/// `(resolution_start, component_start)`, up to `layer_end` layers.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PocEntry {
    pub(crate) resolution_start: u16,
    pub(crate) component_start: u16,
    pub(crate) layer_end: u16,
    pub(crate) resolution_end: u16,
    pub(crate) component_end: u16,
    pub(crate) progression_order: ProgressionOrder,
}

struct IteratorInput<'a> {
    layers: u16,
    tile: &'a Tile,
    max_resolutions: u16,
}

impl<'a> IteratorInput<'a> {
    fn new(tile: &'a Tile) -> Self {
        let max_resolutions = tile
            .component_infos
            .iter()
            .map(|c| c.num_resolution_levels())
            .max()
            .unwrap_or(0);

        Self { layers: tile.num_layers, tile, max_resolutions }
    }
}

/// Builds the full packet sequence for a tile, honouring any POC overrides.
/// With no overrides, the tile's own default progression order applies to
/// every packet. With overrides, each entry contributes the packets its
/// (resolution, component, layer) sub-range covers, in the entry's own
/// progression order, and entries are concatenated in the order they
/// appear in the POC marker.
pub(crate) fn build_packet_sequence(tile: &Tile, poc_entries: &[PocEntry]) -> Vec<ProgressionData> {
    let input = IteratorInput::new(tile);

    if poc_entries.is_empty() {
        return build_sequence(tile.progression_order, &input);
    }

    let mut sequence = Vec::new();
    for entry in poc_entries {
        let full = build_sequence(entry.progression_order, &input);
        sequence.extend(full.into_iter().filter(|p| within(entry, p)));
    }
    sequence
}

fn within(entry: &PocEntry, data: &ProgressionData) -> bool {
    data.resolution >= entry.resolution_start
        && data.resolution < entry.resolution_end
        && data.component >= entry.component_start
        && data.component < entry.component_end
        && data.layer_num < entry.layer_end
}

fn build_sequence(order: ProgressionOrder, input: &IteratorInput<'_>) -> Vec<ProgressionData> {
    match order {
        ProgressionOrder::LayerResolutionComponentPosition => {
            build_layer_resolution_component_position_sequence(input)
        }
        ProgressionOrder::ResolutionLayerComponentPosition => {
            build_resolution_layer_component_position_sequence(input)
        }
        ProgressionOrder::ResolutionPositionComponentLayer => {
            build_resolution_position_component_layer_sequence(input)
        }
        ProgressionOrder::PositionComponentResolutionLayer => {
            build_position_component_resolution_layer_sequence(input)
        }
        ProgressionOrder::ComponentPositionResolutionLayer => {
            build_component_position_resolution_layer_sequence(input)
        }
    }
}

fn build_layer_resolution_component_position_sequence(input: &IteratorInput<'_>) -> Vec<ProgressionData> {
    let mut sequence = Vec::new();

    for layer in 0..input.layers {
        for resolution in 0..input.max_resolutions {
            let tile_instances = tile_instances_for_resolution(input, resolution);

            for (component_idx, tile_instance_opt) in tile_instances.into_iter().enumerate() {
                let Some(tile_instance) = tile_instance_opt else {
                    continue;
                };

                let precinct_count = tile_instance.num_precincts();
                if precinct_count == 0 {
                    continue;
                }

                for precinct in 0..precinct_count {
                    sequence.push(ProgressionData {
                        layer_num: layer,
                        resolution,
                        component: component_idx as u16,
                        precinct,
                    });
                }
            }
        }
    }

    sequence
}

fn build_resolution_layer_component_position_sequence(input: &IteratorInput<'_>) -> Vec<ProgressionData> {
    let mut sequence = Vec::new();

    for resolution in 0..input.max_resolutions {
        let tile_instances = tile_instances_for_resolution(input, resolution);

        for layer in 0..input.layers {
            for (component_idx, tile_instance_opt) in tile_instances.iter().enumerate() {
                let Some(tile_instance) = tile_instance_opt else {
                    continue;
                };

                let precinct_count = tile_instance.num_precincts();
                if precinct_count == 0 {
                    continue;
                }

                for precinct in 0..precinct_count {
                    sequence.push(ProgressionData {
                        layer_num: layer,
                        resolution,
                        component: component_idx as u16,
                        precinct,
                    });
                }
            }
        }
    }

    sequence
}

fn build_resolution_position_component_layer_sequence(input: &IteratorInput<'_>) -> Vec<ProgressionData> {
    let mut sequence = Vec::new();
    let tile_rect = input.tile.rect;

    for resolution in 0..input.max_resolutions {
        let tile_instances = tile_instances_for_resolution(input, resolution);

        for y in tile_rect.y0..tile_rect.y1 {
            for x in tile_rect.x0..tile_rect.x1 {
                for (component_idx, tile_instance_opt) in tile_instances.iter().enumerate() {
                    let Some(resolution_tile) = tile_instance_opt else {
                        continue;
                    };

                    if let Some(precinct) = find_precinct_index(resolution_tile, x, y) {
                        for layer in 0..input.layers {
                            sequence.push(ProgressionData {
                                layer_num: layer,
                                resolution,
                                component: component_idx as u16,
                                precinct,
                            });
                        }
                    }
                }
            }
        }
    }

    sequence
}

fn build_position_component_resolution_layer_sequence(input: &IteratorInput<'_>) -> Vec<ProgressionData> {
    let mut sequence = Vec::new();
    let tile_rect = input.tile.rect;

    for y in tile_rect.y0..tile_rect.y1 {
        for x in tile_rect.x0..tile_rect.x1 {
            for (component_idx, component_tile) in input.tile.component_tiles().enumerate() {
                for resolution_tile in component_tile.resolution_tiles() {
                    if let Some(precinct) = find_precinct_index(&resolution_tile, x, y) {
                        for layer in 0..input.layers {
                            sequence.push(ProgressionData {
                                layer_num: layer,
                                resolution: resolution_tile.resolution,
                                component: component_idx as u16,
                                precinct,
                            });
                        }
                    }
                }
            }
        }
    }

    sequence
}

fn build_component_position_resolution_layer_sequence(input: &IteratorInput<'_>) -> Vec<ProgressionData> {
    let mut sequence = Vec::new();
    let tile_rect = input.tile.rect;

    for (component_idx, component_tile) in input.tile.component_tiles().enumerate() {
        let num_resolution_levels = component_tile.component_info.num_resolution_levels();

        for y in tile_rect.y0..tile_rect.y1 {
            for x in tile_rect.x0..tile_rect.x1 {
                for resolution in 0..num_resolution_levels {
                    let resolution_tile = ResolutionTile::new(component_tile, resolution);

                    if let Some(precinct) = find_precinct_index(&resolution_tile, x, y) {
                        for layer in 0..input.layers {
                            sequence.push(ProgressionData {
                                layer_num: layer,
                                resolution,
                                component: component_idx as u16,
                                precinct,
                            });
                        }
                    }
                }
            }
        }
    }

    sequence
}

fn tile_instances_for_resolution<'a>(
    input: &'a IteratorInput<'a>,
    resolution: u16,
) -> Vec<Option<ResolutionTile<'a>>> {
    input
        .tile
        .component_tiles()
        .map(|component_tile| {
            if resolution < component_tile.component_info.num_resolution_levels() {
                Some(ResolutionTile::new(component_tile, resolution))
            } else {
                None
            }
        })
        .collect()
}

/// Maps a reference-grid position `(x, y)` to the precinct index of
/// `resolution_tile` that contains it, or `None` if `(x, y)` isn't a
/// precinct corner at this resolution (Equation B-16 through B-18).
fn find_precinct_index(resolution_tile: &ResolutionTile, x: u32, y: u32) -> Option<u32> {
    if resolution_tile.num_precincts() == 0 {
        return None;
    }

    let component_info = resolution_tile.component_tile.component_info;
    let tile_rect = resolution_tile.component_tile.tile.rect;

    let num_decomposition_levels =
        component_info.coding_style.parameters.num_decomposition_levels as u32;
    let resolution = resolution_tile.resolution as u32;
    if resolution > num_decomposition_levels {
        return None;
    }

    let vertical_resolution = component_info.size_info.vertical_resolution as u32;
    let horizontal_resolution = component_info.size_info.horizontal_resolution as u32;
    if vertical_resolution == 0 || horizontal_resolution == 0 {
        return None;
    }

    let base_shift = num_decomposition_levels.checked_sub(resolution)?;
    let resolution_scale = 1u64 << base_shift;

    let y_stride_shift = resolution_tile.precinct_exponent_y() as u32 + base_shift;
    let x_stride_shift = resolution_tile.precinct_exponent_x() as u32 + base_shift;
    let y_stride_factor = 1u64 << y_stride_shift;
    let x_stride_factor = 1u64 << x_stride_shift;

    let y_stride = vertical_resolution as u64 * y_stride_factor;
    let x_stride = horizontal_resolution as u64 * x_stride_factor;
    if y_stride == 0 || x_stride == 0 {
        return None;
    }

    let y_val = y as u64;
    let x_val = x as u64;
    let ty0 = tile_rect.y0 as u64;
    let tx0 = tile_rect.x0 as u64;
    let try0 = resolution_tile.rect.y0 as u64;
    let trx0 = resolution_tile.rect.x0 as u64;

    let cond1 = y_val.is_multiple_of(y_stride);
    let cond2 = y_val == ty0 && !(try0 * resolution_scale).is_multiple_of(y_stride);
    if !(cond1 || cond2) {
        return None;
    }

    let cond3 = x_val.is_multiple_of(x_stride);
    let cond4 = x_val == tx0 && !(trx0 * resolution_scale).is_multiple_of(x_stride);
    if !(cond3 || cond4) {
        return None;
    }

    let horizontal_denom = horizontal_resolution as u64 * resolution_scale;
    let vertical_denom = vertical_resolution as u64 * resolution_scale;
    if horizontal_denom == 0 || vertical_denom == 0 {
        return None;
    }

    let precinct_x_scale = 1u64 << (resolution_tile.precinct_exponent_x() as u32);
    let precinct_y_scale = 1u64 << (resolution_tile.precinct_exponent_y() as u32);

    let p1 = x_val.div_ceil(horizontal_denom) / precinct_x_scale;
    let p2 = trx0 / precinct_x_scale;
    let diff_x = p1.checked_sub(p2)?;

    let p4 = y_val.div_ceil(vertical_denom) / precinct_y_scale;
    let p5 = try0 / precinct_y_scale;
    let diff_y = p4.checked_sub(p5)?;

    let precincts_wide = resolution_tile.num_precincts_x() as u64;
    if precincts_wide == 0 {
        return None;
    }

    let precinct = diff_x + precincts_wide * diff_y;
    if precinct >= resolution_tile.num_precincts() as u64 {
        return None;
    }

    precinct.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{
        CodeBlockStyle, CodingStyleComponent, CodingStyleDefault, CodingStyleFlags,
        CodingStyleParameters, ComponentInfo, ComponentSizeInfo, Header, QuantizationInfo,
        SizeData, WaveletTransform,
    };

    fn single_component_header(num_layers: u16, num_resolution_levels: u8, order: ProgressionOrder) -> Header {
        let component_parameters = CodingStyleComponent {
            flags: CodingStyleFlags::default(),
            parameters: CodingStyleParameters {
                num_decomposition_levels: num_resolution_levels - 1,
                num_resolution_levels,
                code_block_width: 6,
                code_block_height: 6,
                code_block_style: CodeBlockStyle::default(),
                transformation: WaveletTransform::Reversible53,
                precinct_exponents: vec![],
            },
        };

        let component_info = ComponentInfo {
            size_info: ComponentSizeInfo {
                precision: 8,
                is_signed: false,
                horizontal_resolution: 1,
                vertical_resolution: 1,
            },
            coding_style: component_parameters.clone(),
            quantization_info: QuantizationInfo::default(),
        };

        Header {
            size_data: SizeData {
                reference_grid_width: 64,
                reference_grid_height: 64,
                image_area_x_offset: 0,
                image_area_y_offset: 0,
                tile_width: 64,
                tile_height: 64,
                tile_x_offset: 0,
                tile_y_offset: 0,
                component_sizes: vec![component_info.size_info],
            },
            global_coding_style: CodingStyleDefault {
                progression_order: order,
                num_layers,
                mct: false,
                component_parameters,
            },
            component_infos: vec![component_info],
        }
    }

    #[test]
    fn lrcp_and_rlcp_are_permutations_of_the_same_packets() {
        let header = single_component_header(3, 3, ProgressionOrder::LayerResolutionComponentPosition);
        let tile = Tile::new(0, &header);
        let lrcp = build_packet_sequence(&tile, &[]);

        let mut rlcp_header = header.clone();
        rlcp_header.global_coding_style.progression_order = ProgressionOrder::ResolutionLayerComponentPosition;
        let rlcp_tile = Tile::new(0, &rlcp_header);
        let rlcp = build_packet_sequence(&rlcp_tile, &[]);

        assert_eq!(lrcp.len(), rlcp.len());

        let mut lrcp_sorted = lrcp.clone();
        let mut rlcp_sorted = rlcp.clone();
        lrcp_sorted.sort_by_key(|p| (p.layer_num, p.resolution, p.component, p.precinct));
        rlcp_sorted.sort_by_key(|p| (p.layer_num, p.resolution, p.component, p.precinct));
        assert_eq!(lrcp_sorted, rlcp_sorted);

        assert_ne!(lrcp, rlcp, "different progression orders should lay packets out differently");
    }

    #[test]
    fn poc_override_restricts_to_its_sub_range() {
        let header = single_component_header(2, 2, ProgressionOrder::LayerResolutionComponentPosition);
        let tile = Tile::new(0, &header);

        let poc = [PocEntry {
            resolution_start: 0,
            component_start: 0,
            layer_end: 1,
            resolution_end: 1,
            component_end: 1,
            progression_order: ProgressionOrder::ResolutionLayerComponentPosition,
        }];

        let sequence = build_packet_sequence(&tile, &poc);
        assert!(sequence.iter().all(|p| p.resolution == 0 && p.layer_num == 0));
        assert!(!sequence.is_empty());
    }
}
