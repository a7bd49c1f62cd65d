//! Packet header coding, Annex B.10.3-B.10.6.
//!
//! A packet carries, for one (component, resolution, precinct, layer), the
//! header described here followed by the raw entropy-coded bytes ([`crate::tier1`])
//! it references. Reading is grounded on the teacher's `get_code_block_lengths`/
//! `get_code_block_data_inner`; writing is the mirror, driven by a rate
//! allocation the caller (the encoder's PCRD-opt pass) has already decided --
//! this module only serializes it.

use crate::bit_reader::BitReader;
use crate::bit_writer::BitWriter;
use crate::byte_reader::Reader;
use crate::image::{CodeBlock, CodeBlockStyle, ComponentInfo, Layer, Segment, SubBandIter, TileGeometry};
use crate::markers::{EPH, SOP};

/// Splits the coding passes newly contributed by a layer into the codeword
/// segments Annex B's termination modes require, mirroring the teacher's
/// `segment_idx_for_bypass`/`get_segment` pair in both directions.
fn segment_idx_for_bypass(code_block_idx: u32) -> u32 {
    if code_block_idx < 10 {
        0
    } else {
        1 + (2 * ((code_block_idx - 10) / 3)) + u32::from((code_block_idx - 10) % 3 == 2)
    }
}

fn segment_for_pass(style: &CodeBlockStyle, non_empty_layer_count: u32, coding_pass_idx: u32) -> u32 {
    if style.termination_on_each_pass {
        coding_pass_idx
    } else if style.selective_arithmetic_coding_bypass {
        segment_idx_for_bypass(coding_pass_idx)
    } else {
        non_empty_layer_count
    }
}

/// Table B.4: the number of coding passes a codeword commits to, reading it
/// out of a bit-stuffed cursor.
fn read_pass_count_codeword(reader: &mut BitReader) -> Option<u32> {
    if reader.peek_bits_with_stuffing(9) == Some(0x1ff) {
        reader.read_bits_with_stuffing(9)?;
        Some(reader.read_bits_with_stuffing(7)? + 37)
    } else if reader.peek_bits_with_stuffing(4) == Some(0x0f) {
        reader.read_bits_with_stuffing(4)?;
        Some(reader.read_bits_with_stuffing(5)? + 6)
    } else if reader.peek_bits_with_stuffing(4) == Some(0b1110) {
        reader.read_bits_with_stuffing(4)?;
        Some(5)
    } else if reader.peek_bits_with_stuffing(4) == Some(0b1101) {
        reader.read_bits_with_stuffing(4)?;
        Some(4)
    } else if reader.peek_bits_with_stuffing(4) == Some(0b1100) {
        reader.read_bits_with_stuffing(4)?;
        Some(3)
    } else if reader.peek_bits_with_stuffing(2) == Some(0b10) {
        reader.read_bits_with_stuffing(2)?;
        Some(2)
    } else if reader.peek_bits_with_stuffing(1) == Some(0) {
        reader.read_bits_with_stuffing(1)?;
        Some(1)
    } else {
        None
    }
}

/// The mirror of [`read_pass_count_codeword`]: writes the Table B.4 codeword
/// for `passes` (1..=164).
fn write_pass_count_codeword(writer: &mut BitWriter, passes: u32) {
    match passes {
        1 => writer.write_bits_with_stuffing(0, 1),
        2 => writer.write_bits_with_stuffing(0b10, 2),
        3 => writer.write_bits_with_stuffing(0b1100, 4),
        4 => writer.write_bits_with_stuffing(0b1101, 4),
        5 => writer.write_bits_with_stuffing(0b1110, 4),
        6..=37 => {
            writer.write_bits_with_stuffing(0b1111, 4);
            writer.write_bits_with_stuffing(passes - 6, 5);
        }
        38..=164 => {
            writer.write_bits_with_stuffing(0x1ff, 9);
            writer.write_bits_with_stuffing(passes - 37, 7);
        }
        _ => panic!("coding pass count {passes} exceeds Table B.4's 164-pass limit"),
    }
}

/// Reads the packet header for one (resolution, precinct, layer) of one
/// component: the zero-length bit and, for each sub-band the resolution
/// contributes, the B.10.4-B.10.6 per-code-block fields. Appends the
/// resulting [`Segment`]s (with their data left empty -- the caller fills
/// them in from the packet body) to `tile_geometry`.
///
/// Returns whether the packet was zero-length.
pub(crate) fn read_packet_header(
    sub_band_iter: SubBandIter,
    precinct_idx: u32,
    layer_num: u32,
    component_info: &ComponentInfo,
    reader: &mut BitReader,
    tile_geometry: &mut TileGeometry,
) -> Option<bool> {
    let zero_length = reader.read_bits_with_stuffing(1)? == 0;

    if !zero_length {
        for sub_band_idx in sub_band_iter {
            read_code_block_lengths(sub_band_idx, precinct_idx, layer_num, reader, tile_geometry, component_info)?;
        }
    }

    Some(zero_length)
}

fn read_code_block_lengths(
    sub_band_idx: usize,
    precinct_idx: u32,
    layer_num: u32,
    reader: &mut BitReader,
    tile_geometry: &mut TileGeometry,
    component_info: &ComponentInfo,
) -> Option<()> {
    let precinct_range = tile_geometry.sub_bands[sub_band_idx].precincts.clone();
    let precinct = &mut tile_geometry.precincts[precinct_range][precinct_idx as usize];
    let code_block_range = precinct.code_blocks.clone();

    for code_block in &mut tile_geometry.code_blocks[code_block_range] {
        let is_included = if code_block.has_been_included {
            reader.read_bits_with_stuffing(1)? == 1
        } else {
            precinct.code_inclusion_tree.read(code_block.x_idx, code_block.y_idx, reader, layer_num + 1, &mut tile_geometry.tag_nodes)? <= layer_num
        };

        if !is_included {
            continue;
        }

        let included_first_time = !code_block.has_been_included;

        if included_first_time {
            code_block.missing_bit_planes = precinct
                .zero_bitplane_tree
                .read(code_block.x_idx, code_block.y_idx, reader, u32::MAX, &mut tile_geometry.tag_nodes)? as u8;
        }

        code_block.has_been_included = true;

        let added_coding_passes = read_pass_count_codeword(reader)?;

        let mut k = 0u32;
        while reader.read_bits_with_stuffing(1)? == 1 {
            k += 1;
        }
        code_block.l_block += k;

        let previous_layers_passes = code_block.number_of_coding_passes;
        let cumulative_passes = previous_layers_passes + added_coding_passes;
        let style = component_info.code_block_style();

        let start = tile_geometry.segments.len();
        let mut last_segment = segment_for_pass(style, code_block.non_empty_layer_count, previous_layers_passes);
        let mut coding_passes_for_segment = 0u32;

        for coding_pass in previous_layers_passes..cumulative_passes {
            let segment = segment_for_pass(style, code_block.non_empty_layer_count, coding_pass);

            if segment != last_segment {
                push_read_segment(tile_geometry, reader, code_block, last_segment, coding_passes_for_segment)?;
                last_segment = segment;
                coding_passes_for_segment = 1;
            } else {
                coding_passes_for_segment += 1;
            }
        }

        if coding_passes_for_segment > 0 {
            push_read_segment(tile_geometry, reader, code_block, last_segment, coding_passes_for_segment)?;
        }

        let end = tile_geometry.segments.len();
        let layer_idx = code_block.layers.start + layer_num as usize;
        tile_geometry.layers[layer_idx].segments = Some(start..end);
        code_block.number_of_coding_passes += added_coding_passes;
        code_block.non_empty_layer_count += 1;
    }

    Some(())
}

fn push_read_segment(tile_geometry: &mut TileGeometry, reader: &mut BitReader, code_block: &CodeBlock, segment_idx: u32, coding_passes: u32) -> Option<()> {
    assert!(coding_passes > 0);
    let length_bits = code_block.l_block + coding_passes.ilog2();
    let length = reader.read_bits_with_stuffing(length_bits as u8)?;

    tile_geometry.segments.push(Segment { idx: segment_idx, data_length: length, coding_passes, data: &[] });

    Some(())
}

/// Reads one tile-part's worth of packets in progression order, extracting
/// each packet's entropy-coded bytes from the packet body. `sub_band_iters`
/// yields, for each packet in order, the sub-bands the packet's resolution
/// contributes plus its (component, precinct, layer) address.
pub(crate) fn read_packets<'a>(
    tile_part_data: &'a [u8],
    mut packets: impl Iterator<Item = (SubBandIter, u32, u32, u16)>,
    component_infos: &[ComponentInfo],
    tile_geometry: &mut TileGeometry<'a>,
) -> Option<()> {
    let mut data = tile_part_data;

    while !data.is_empty() {
        let (sub_band_iter, precinct_idx, layer_num, component) = packets.next()?;
        let component_info = &component_infos[component as usize];

        if component_info.coding_style.flags.may_use_sop_markers() {
            let mut reader = Reader::new(data);
            if reader.peek_marker() == Some(SOP) {
                reader.read_marker()?;
                reader.skip_bytes(4)?;
                data = reader.tail()?;
            }
        }

        let mut bit_reader = BitReader::new(data);
        read_packet_header(sub_band_iter.clone(), precinct_idx, layer_num, component_info, &mut bit_reader, tile_geometry)?;

        bit_reader.read_stuff_bit_if_necessary()?;
        bit_reader.align();
        let packet_data = bit_reader.tail()?;

        let mut body_reader = Reader::new(packet_data);

        if component_info.coding_style.flags.uses_eph_marker() && body_reader.read_marker()? != EPH {
            return None;
        }

        for sub_band_idx in sub_band_iter {
            let precinct_range = tile_geometry.sub_bands[sub_band_idx].precincts.clone();
            let precinct = &tile_geometry.precincts[precinct_range][precinct_idx as usize];
            let code_block_range = precinct.code_blocks.clone();

            for code_block in &tile_geometry.code_blocks[code_block_range] {
                let layer_idx = code_block.layers.start + layer_num as usize;
                if let Some(segments) = tile_geometry.layers[layer_idx].segments.clone() {
                    for segment in &mut tile_geometry.segments[segments] {
                        segment.data = body_reader.read_bytes(segment.data_length as usize)?;
                    }
                }
            }
        }

        data = body_reader.tail()?;
    }

    Some(())
}

/// One code-block's contribution to a packet being written: `None` means
/// the code-block is not included in this layer (either never included, or
/// already included and held back). The rate-control pass ([`crate::pcrd`])
/// decides this; this module only serializes it.
pub(crate) struct WriteContribution<'a> {
    pub(crate) code_block_idx: usize,
    pub(crate) added_coding_passes: u32,
    /// Bytes for each codeword segment this layer contributes, already
    /// entropy-coded by [`crate::tier1::encode`] and sliced to the pass
    /// ranges [`segment_for_pass`] would also compute for this code-block.
    pub(crate) segment_bytes: Vec<&'a [u8]>,
}

/// Writes the packet header mirror of [`read_packet_header`]: for every
/// code-block in `contributions`, the inclusion bit/tag-tree entry, the
/// zero-bit-plane tag-tree entry on first inclusion, the Table B.4
/// pass-count codeword, the Lblock increment, and the per-segment length
/// fields. Code-blocks absent from `contributions` are coded as "not
/// included". Returns the packet body bytes (the concatenation of every
/// contribution's `segment_bytes`, in the order their lengths were written).
pub(crate) fn write_packet_header(
    sub_band_iter: SubBandIter,
    precinct_idx: u32,
    layer_num: u32,
    component_info: &ComponentInfo,
    contributions: &[WriteContribution],
    tile_geometry: &mut TileGeometry,
    writer: &mut BitWriter,
) -> Vec<u8> {
    let mut body = Vec::new();
    let zero_length = contributions.iter().all(|c| c.added_coding_passes == 0);
    writer.write_bits_with_stuffing(u32::from(!zero_length), 1);

    if zero_length {
        return body;
    }

    for sub_band_idx in sub_band_iter {
        let precinct_range = tile_geometry.sub_bands[sub_band_idx].precincts.clone();
        let precinct = &mut tile_geometry.precincts[precinct_range][precinct_idx as usize];
        let code_block_range = precinct.code_blocks.clone();

        for (local_idx, code_block) in tile_geometry.code_blocks[code_block_range.clone()].iter_mut().enumerate() {
            let global_idx = code_block_range.start + local_idx;
            let contribution = contributions.iter().find(|c| c.code_block_idx == global_idx);
            let added_coding_passes = contribution.map(|c| c.added_coding_passes).unwrap_or(0);

            if !code_block.has_been_included {
                // The tag tree needs the true first-inclusion layer, known
                // up front from the whole precinct's rate allocation; a
                // code-block contributing passes *now* is first included
                // now, one never contributing anything is pinned above the
                // tree's `max_val` ceiling (it never resolves to `<=
                // layer_num` for any layer).
                let target = if added_coding_passes > 0 { layer_num } else { u32::MAX };
                precinct.code_inclusion_tree.write(code_block.x_idx, code_block.y_idx, writer, layer_num + 1, target, &mut tile_geometry.tag_nodes);
            } else {
                writer.write_bits_with_stuffing(u32::from(added_coding_passes > 0), 1);
            }

            if added_coding_passes == 0 {
                continue;
            }

            let included_first_time = !code_block.has_been_included;
            if included_first_time {
                precinct.zero_bitplane_tree.write(
                    code_block.x_idx,
                    code_block.y_idx,
                    writer,
                    u32::MAX,
                    code_block.missing_bit_planes as u32,
                    &mut tile_geometry.tag_nodes,
                );
            }

            code_block.has_been_included = true;

            write_pass_count_codeword(writer, added_coding_passes);

            let style = component_info.code_block_style();
            let previous_layers_passes = code_block.number_of_coding_passes;
            let cumulative_passes = previous_layers_passes + added_coding_passes;

            let mut last_segment = segment_for_pass(style, code_block.non_empty_layer_count, previous_layers_passes);
            let mut coding_passes_for_segment = 0u32;
            let mut segment_lengths = Vec::new();

            for coding_pass in previous_layers_passes..cumulative_passes {
                let segment = segment_for_pass(style, code_block.non_empty_layer_count, coding_pass);

                if segment != last_segment {
                    segment_lengths.push(coding_passes_for_segment);
                    last_segment = segment;
                    coding_passes_for_segment = 1;
                } else {
                    coding_passes_for_segment += 1;
                }
            }
            if coding_passes_for_segment > 0 {
                segment_lengths.push(coding_passes_for_segment);
            }

            let contribution = contribution.expect("added_coding_passes > 0 implies a contribution is present");
            assert_eq!(segment_lengths.len(), contribution.segment_bytes.len());

            // Lblock only ever grows: find the smallest value (current or
            // higher) under which every segment's actual byte length still
            // fits in `Lblock + floor(log2(coding_passes))` bits.
            let mut needed_l_block = code_block.l_block;
            for (coding_passes, bytes) in segment_lengths.iter().zip(contribution.segment_bytes.iter()) {
                let bits_for_length = bit_length(bytes.len() as u32);
                let min_l_block = bits_for_length.saturating_sub(coding_passes.ilog2());
                needed_l_block = needed_l_block.max(min_l_block);
            }

            let k = needed_l_block - code_block.l_block;
            for _ in 0..k {
                writer.write_bits_with_stuffing(1, 1);
            }
            writer.write_bits_with_stuffing(0, 1);
            code_block.l_block += k;

            for (coding_passes, bytes) in segment_lengths.iter().zip(contribution.segment_bytes.iter()) {
                let length_bits = code_block.l_block + coding_passes.ilog2();
                writer.write_bits_with_stuffing(bytes.len() as u32, length_bits as u8);
                body.extend_from_slice(bytes);
            }

            code_block.number_of_coding_passes += added_coding_passes;
            code_block.non_empty_layer_count += 1;
        }
    }

    body
}

/// The number of bits needed to represent `v` in binary (0 for `v == 0`).
fn bit_length(v: u32) -> u32 {
    32 - v.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_count_codeword_round_trips() {
        for passes in 1..=164u32 {
            let mut writer = BitWriter::new();
            write_pass_count_codeword(&mut writer, passes);
            let bytes = writer.finish();
            let mut reader = BitReader::new(&bytes);
            assert_eq!(read_pass_count_codeword(&mut reader), Some(passes), "passes={passes}");
        }
    }

    #[test]
    fn segment_assignment_matches_non_empty_layer_count_in_normal_mode() {
        let style = CodeBlockStyle::default();
        assert_eq!(segment_for_pass(&style, 0, 5), 0);
        assert_eq!(segment_for_pass(&style, 3, 100), 3);
    }

    #[test]
    fn bypass_segment_indices_match_reference_sequence() {
        assert_eq!(segment_idx_for_bypass(0), 0);
        assert_eq!(segment_idx_for_bypass(9), 0);
        assert_eq!(segment_idx_for_bypass(10), 1);
        assert_eq!(segment_idx_for_bypass(12), 1);
        assert_eq!(segment_idx_for_bypass(13), 2);
    }
}
