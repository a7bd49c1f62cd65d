//! Marker-segment parsing and writing (Annex A): SIZ/COD/COC/QCD/QCC/POC
//! in the main header, the SOT/SOD tile-part framing, and the SOC/EOC
//! codestream delimiters.
//!
//! Decodes into and encodes out of the value types in [`crate::image`];
//! this module only deals with marker byte layout. Both directions are
//! kept next to each other marker by marker, since a writer and its reader
//! always agree on field order.

use crate::byte_reader::{Reader, ReaderExt, Writer};
use crate::error::{J2kError, Result};
use crate::image::{
    CodeBlockStyle, CodingStyleComponent, CodingStyleDefault, CodingStyleFlags,
    CodingStyleParameters, ComponentInfo, ComponentSizeInfo, Header, ProgressionOrder,
    QuantizationInfo, QuantizationStyle, SizeData, Tile, WaveletTransform,
};
use crate::markers;
use crate::progression::PocEntry;

/// SOT marker fields (A.4.2).
#[derive(Clone, Copy, Debug)]
pub(crate) struct TilePartHeader {
    pub(crate) tile_index: u16,
    /// Zero until the final tile-part, when it may be left unknown and
    /// inferred from the remaining codestream length instead.
    pub(crate) tile_part_length: u32,
    pub(crate) tile_part_index: u8,
    pub(crate) num_tile_parts: u8,
}

/// A tile's geometry, the raw still-entropy-coded bytes of each of its
/// tile-parts, and whatever POC override is in effect for it (inherited
/// from the main header, or replaced by a tile-part-local POC marker).
pub(crate) struct ParsedTile<'a> {
    pub(crate) tile: Tile,
    pub(crate) tile_parts: Vec<&'a [u8]>,
    pub(crate) poc_entries: Vec<PocEntry>,
}

/// Reads a full codestream: `SOC`, main header, every tile-part, `EOC`.
pub(crate) fn read(stream: &[u8]) -> Result<(Header, Vec<ParsedTile<'_>>)> {
    let mut reader = Reader::new(stream);
    reader.expect_marker(markers::SOC)?;

    let (header, poc_entries) = read_header(&mut reader)?;
    let tiles = read_tiles(&mut reader, &header, &poc_entries)?;

    reader.expect_marker(markers::EOC)?;

    Ok((header, tiles))
}

fn read_header(reader: &mut Reader) -> Result<(Header, Vec<PocEntry>)> {
    reader.expect_marker(markers::SIZ)?;
    let size_data = size_marker(reader)?;
    let num_components = size_data.component_sizes.len() as u16;

    let mut cod: Option<CodingStyleDefault> = None;
    let mut qcd: Option<QuantizationInfo> = None;
    let mut cod_components = vec![None; num_components as usize];
    let mut qcd_components = vec![None; num_components as usize];
    let mut poc_entries = Vec::new();

    loop {
        let offset = reader.offset();
        let marker = reader
            .peek_marker()
            .ok_or_else(|| J2kError::truncated(offset, "marker in main header"))?;

        match marker {
            markers::SOT => break,
            markers::COD => {
                reader.read_marker();
                cod = Some(cod_marker(reader)?);
            }
            markers::COC => {
                reader.read_marker();
                let (component_index, coc) = coc_marker(reader, num_components)?;
                *cod_components
                    .get_mut(component_index as usize)
                    .ok_or_else(|| J2kError::malformed("COC", offset, "component index out of range"))? =
                    Some(coc);
            }
            markers::QCD => {
                reader.read_marker();
                qcd = Some(qcd_marker(reader)?);
            }
            markers::QCC => {
                reader.read_marker();
                let (component_index, qcc) = qcc_marker(reader, num_components)?;
                *qcd_components
                    .get_mut(component_index as usize)
                    .ok_or_else(|| J2kError::malformed("QCC", offset, "component index out of range"))? =
                    Some(qcc);
            }
            markers::POC => {
                reader.read_marker();
                poc_entries = poc_marker(reader, num_components)?;
            }
            markers::RGN | markers::TLM | markers::PLM | markers::PLT | markers::PPM
            | markers::PPT | markers::CRG | markers::COM => {
                reader.read_marker();
                skip_marker_segment(reader, offset)?;
            }
            _ => {
                return Err(J2kError::malformed(
                    "main header",
                    offset,
                    "unrecognised marker in main header",
                ));
            }
        }
    }

    let cod = cod.ok_or_else(|| J2kError::missing_marker("COD", reader.offset()))?;
    let qcd = qcd.ok_or_else(|| J2kError::missing_marker("QCD", reader.offset()))?;

    let component_infos: Vec<ComponentInfo> = size_data
        .component_sizes
        .iter()
        .enumerate()
        .map(|(idx, size_info)| ComponentInfo {
            size_info: *size_info,
            coding_style: cod_components[idx].clone().unwrap_or_else(|| cod.component_parameters.clone()),
            quantization_info: qcd_components[idx].clone().unwrap_or_else(|| qcd.clone()),
        })
        .collect();

    Ok((
        Header { size_data, global_coding_style: cod, component_infos },
        poc_entries,
    ))
}

/// Assembles the main header: `SIZ`, `COD`, `QCD`, and a `POC` marker when
/// `poc_entries` is non-empty. Per-component COC/QCC overrides already
/// folded into `header.component_infos` are not re-emitted here; a caller
/// that wants them round-tripped byte-for-byte would need to diff each
/// component against the default and emit COC/QCC for the ones that
/// differ, which this codec does not need since it always derives a fresh
/// header from an `EncoderConfig` rather than preserving a foreign one.
pub(crate) fn write_header(writer: &mut Writer, header: &Header, poc_entries: &[PocEntry]) {
    writer.write_marker(markers::SOC);
    writer.write_marker(markers::SIZ);
    write_size_marker(writer, &header.size_data);

    writer.write_marker(markers::COD);
    write_cod_marker(writer, &header.global_coding_style);

    writer.write_marker(markers::QCD);
    write_qcd_marker(writer, &header.component_infos[0].quantization_info);

    if !poc_entries.is_empty() {
        writer.write_marker(markers::POC);
        write_poc_marker(writer, poc_entries, header.component_infos.len() as u16);
    }
}

/// SIZ marker (A.5.1).
fn size_marker(reader: &mut Reader) -> Result<SizeData> {
    let offset = reader.offset();
    let size_data = size_marker_inner(reader)
        .ok_or_else(|| J2kError::truncated(offset, "SIZ marker"))?;

    if size_data.tile_width == 0
        || size_data.tile_height == 0
        || size_data.reference_grid_width == 0
        || size_data.reference_grid_height == 0
    {
        return Err(J2kError::malformed("SIZ", offset, "zero image or tile dimension"));
    }

    if size_data.tile_x_offset >= size_data.reference_grid_width
        || size_data.tile_y_offset >= size_data.reference_grid_height
    {
        return Err(J2kError::malformed("SIZ", offset, "tile grid offset outside image"));
    }

    // B-3: the tile grid offset shall not exceed the image area offset.
    if size_data.tile_x_offset > size_data.image_area_x_offset
        || size_data.tile_y_offset > size_data.image_area_y_offset
    {
        return Err(J2kError::malformed("SIZ", offset, "tile offset exceeds image area offset"));
    }

    // B-4: tile 0 must contain at least one reference grid point of the
    // image area.
    if size_data.tile_x_offset + size_data.tile_width <= size_data.image_area_x_offset
        || size_data.tile_y_offset + size_data.tile_height <= size_data.image_area_y_offset
    {
        return Err(J2kError::malformed("SIZ", offset, "tile 0 does not overlap the image area"));
    }

    for comp in &size_data.component_sizes {
        if comp.precision == 0 || comp.horizontal_resolution == 0 || comp.vertical_resolution == 0 {
            return Err(J2kError::malformed("SIZ", offset, "zero component precision or resolution"));
        }

        if comp.precision > 16 {
            return Err(J2kError::UnsupportedFeature {
                feature: "component bit depth above 16",
                offset,
            });
        }
    }

    Ok(size_data)
}

fn size_marker_inner(reader: &mut Reader) -> Option<SizeData> {
    let _length = reader.read_u16()?;
    let _capabilities = reader.read_u16()?;

    let xsiz = reader.read_u32()?;
    let ysiz = reader.read_u32()?;
    let x_osiz = reader.read_u32()?;
    let y_osiz = reader.read_u32()?;
    let xt_siz = reader.read_u32()?;
    let yt_siz = reader.read_u32()?;
    let xto_siz = reader.read_u32()?;
    let yto_siz = reader.read_u32()?;
    let csiz = reader.read_u16()?;

    let mut components = Vec::with_capacity(csiz as usize);
    for _ in 0..csiz {
        let ssiz = reader.read_byte()?;
        let x_rsiz = reader.read_byte()?;
        let y_rsiz = reader.read_byte()?;

        components.push(ComponentSizeInfo {
            precision: (ssiz & 0x7F) + 1,
            is_signed: (ssiz & 0x80) != 0,
            horizontal_resolution: x_rsiz,
            vertical_resolution: y_rsiz,
        });
    }

    Some(SizeData {
        reference_grid_width: xsiz,
        reference_grid_height: ysiz,
        image_area_x_offset: x_osiz,
        image_area_y_offset: y_osiz,
        tile_width: xt_siz,
        tile_height: yt_siz,
        tile_x_offset: xto_siz,
        tile_y_offset: yto_siz,
        component_sizes: components,
    })
}

fn write_size_marker(writer: &mut Writer, size_data: &SizeData) {
    let length_at = writer.position();
    writer.write_u16(0);
    writer.write_u16(0); // Rsiz: no extended capabilities used.

    writer.write_u32(size_data.reference_grid_width);
    writer.write_u32(size_data.reference_grid_height);
    writer.write_u32(size_data.image_area_x_offset);
    writer.write_u32(size_data.image_area_y_offset);
    writer.write_u32(size_data.tile_width);
    writer.write_u32(size_data.tile_height);
    writer.write_u32(size_data.tile_x_offset);
    writer.write_u32(size_data.tile_y_offset);
    writer.write_u16(size_data.component_sizes.len() as u16);

    for comp in &size_data.component_sizes {
        let ssiz = (comp.precision - 1) | if comp.is_signed { 0x80 } else { 0 };
        writer.write_byte(ssiz);
        writer.write_byte(comp.horizontal_resolution);
        writer.write_byte(comp.vertical_resolution);
    }

    let length = (writer.position() - length_at) as u16;
    writer.patch_u16(length_at, length);
}

fn coding_style_flags_from_u8(value: u8) -> CodingStyleFlags {
    CodingStyleFlags {
        uses_precincts: value & 0x01 != 0,
        uses_sop_markers: value & 0x02 != 0,
        uses_eph_markers: value & 0x04 != 0,
    }
}

fn coding_style_flags_to_u8(flags: &CodingStyleFlags) -> u8 {
    (flags.uses_precincts as u8) | ((flags.uses_sop_markers as u8) << 1) | ((flags.uses_eph_markers as u8) << 2)
}

fn code_block_style_from_u8(value: u8) -> CodeBlockStyle {
    CodeBlockStyle {
        selective_arithmetic_coding_bypass: value & 0x01 != 0,
        reset_context_probabilities: value & 0x02 != 0,
        termination_on_each_pass: value & 0x04 != 0,
        vertically_causal_context: value & 0x08 != 0,
        predictable_termination: value & 0x10 != 0,
        segmentation_symbols: value & 0x20 != 0,
    }
}

fn code_block_style_to_u8(style: &CodeBlockStyle) -> u8 {
    (style.selective_arithmetic_coding_bypass as u8)
        | ((style.reset_context_probabilities as u8) << 1)
        | ((style.termination_on_each_pass as u8) << 2)
        | ((style.vertically_causal_context as u8) << 3)
        | ((style.predictable_termination as u8) << 4)
        | ((style.segmentation_symbols as u8) << 5)
}

fn wavelet_transform_from_u8(value: u8, offset: usize) -> Result<WaveletTransform> {
    match value {
        0 => Ok(WaveletTransform::Irreversible97),
        1 => Ok(WaveletTransform::Reversible53),
        _ => Err(J2kError::malformed("COD/COC", offset, "invalid transformation type")),
    }
}

fn wavelet_transform_to_u8(transform: WaveletTransform) -> u8 {
    match transform {
        WaveletTransform::Irreversible97 => 0,
        WaveletTransform::Reversible53 => 1,
    }
}

fn progression_order_from_u8(value: u8, offset: usize) -> Result<ProgressionOrder> {
    match value {
        0 => Ok(ProgressionOrder::LayerResolutionComponentPosition),
        1 => Ok(ProgressionOrder::ResolutionLayerComponentPosition),
        2 => Ok(ProgressionOrder::ResolutionPositionComponentLayer),
        3 => Ok(ProgressionOrder::PositionComponentResolutionLayer),
        4 => Ok(ProgressionOrder::ComponentPositionResolutionLayer),
        _ => Err(J2kError::malformed("COD", offset, "invalid progression order")),
    }
}

fn progression_order_to_u8(order: ProgressionOrder) -> u8 {
    match order {
        ProgressionOrder::LayerResolutionComponentPosition => 0,
        ProgressionOrder::ResolutionLayerComponentPosition => 1,
        ProgressionOrder::ResolutionPositionComponentLayer => 2,
        ProgressionOrder::PositionComponentResolutionLayer => 3,
        ProgressionOrder::ComponentPositionResolutionLayer => 4,
    }
}

/// Shared body of the COD and COC markers (SPcod/SPcoc, A.6.1/A.6.2).
fn coding_style_parameters(reader: &mut Reader, flags: &CodingStyleFlags) -> Result<CodingStyleParameters> {
    let offset = reader.offset();
    let missing = || J2kError::truncated(offset, "coding style parameters");

    let num_decomposition_levels = reader.read_byte().ok_or_else(missing)?;
    let num_resolution_levels = num_decomposition_levels
        .checked_add(1)
        .ok_or_else(|| J2kError::malformed("COD/COC", offset, "decomposition level count overflows"))?;
    let code_block_width = reader.read_byte().ok_or_else(missing)? + 2;
    let code_block_height = reader.read_byte().ok_or_else(missing)? + 2;
    let code_block_style = code_block_style_from_u8(reader.read_byte().ok_or_else(missing)?);
    let transformation = wavelet_transform_from_u8(reader.read_byte().ok_or_else(missing)?, offset)?;

    let mut precinct_exponents = Vec::new();
    if flags.uses_precincts {
        for _ in 0..num_resolution_levels {
            let precinct_size = reader.read_byte().ok_or_else(missing)?;
            precinct_exponents.push((precinct_size & 0xF, precinct_size >> 4));
        }
    } else {
        for _ in 0..num_resolution_levels {
            precinct_exponents.push((15, 15));
        }
    }

    Ok(CodingStyleParameters {
        num_decomposition_levels,
        num_resolution_levels,
        code_block_width,
        code_block_height,
        code_block_style,
        transformation,
        precinct_exponents,
    })
}

fn write_coding_style_parameters(writer: &mut Writer, flags: &CodingStyleFlags, parameters: &CodingStyleParameters) {
    writer.write_byte(parameters.num_decomposition_levels);
    writer.write_byte(parameters.code_block_width - 2);
    writer.write_byte(parameters.code_block_height - 2);
    writer.write_byte(code_block_style_to_u8(&parameters.code_block_style));
    writer.write_byte(wavelet_transform_to_u8(parameters.transformation));

    if flags.uses_precincts {
        for &(width_exp, height_exp) in &parameters.precinct_exponents {
            writer.write_byte((height_exp << 4) | (width_exp & 0xF));
        }
    }
}

/// COD marker (A.6.1).
fn cod_marker(reader: &mut Reader) -> Result<CodingStyleDefault> {
    let offset = reader.offset();
    let missing = || J2kError::truncated(offset, "COD marker");

    let _length = reader.read_u16().ok_or_else(missing)?;
    let flags = coding_style_flags_from_u8(reader.read_byte().ok_or_else(missing)?);
    let progression_order = progression_order_from_u8(reader.read_byte().ok_or_else(missing)?, offset)?;
    let num_layers = reader.read_u16().ok_or_else(missing)?;
    let mct = reader.read_byte().ok_or_else(missing)? == 1;
    let parameters = coding_style_parameters(reader, &flags)?;

    Ok(CodingStyleDefault {
        progression_order,
        num_layers,
        mct,
        component_parameters: CodingStyleComponent { flags, parameters },
    })
}

fn write_cod_marker(writer: &mut Writer, cod: &CodingStyleDefault) {
    let length_at = writer.position();
    writer.write_u16(0);
    writer.write_byte(coding_style_flags_to_u8(&cod.component_parameters.flags));
    writer.write_byte(progression_order_to_u8(cod.progression_order));
    writer.write_u16(cod.num_layers);
    writer.write_byte(cod.mct as u8);
    write_coding_style_parameters(writer, &cod.component_parameters.flags, &cod.component_parameters.parameters);

    let length = (writer.position() - length_at) as u16;
    writer.patch_u16(length_at, length);
}

fn read_component_index(reader: &mut Reader, csiz: u16) -> Option<u16> {
    if csiz < 257 {
        reader.read_byte().map(|b| b as u16)
    } else {
        reader.read_u16()
    }
}

fn write_component_index(writer: &mut Writer, csiz: u16, component_index: u16) {
    if csiz < 257 {
        writer.write_byte(component_index as u8);
    } else {
        writer.write_u16(component_index);
    }
}

/// COC marker (A.6.2).
fn coc_marker(reader: &mut Reader, csiz: u16) -> Result<(u16, CodingStyleComponent)> {
    let offset = reader.offset();
    let missing = || J2kError::truncated(offset, "COC marker");

    let _length = reader.read_u16().ok_or_else(missing)?;
    let component_index = read_component_index(reader, csiz).ok_or_else(missing)?;
    let flags = coding_style_flags_from_u8(reader.read_byte().ok_or_else(missing)?);
    let parameters = coding_style_parameters(reader, &flags)?;

    Ok((component_index, CodingStyleComponent { flags, parameters }))
}

fn write_coc_marker(writer: &mut Writer, csiz: u16, component_index: u16, coc: &CodingStyleComponent) {
    let length_at = writer.position();
    writer.write_u16(0);
    write_component_index(writer, csiz, component_index);
    writer.write_byte(coding_style_flags_to_u8(&coc.flags));
    write_coding_style_parameters(writer, &coc.flags, &coc.parameters);

    let length = (writer.position() - length_at) as u16;
    writer.patch_u16(length_at, length);
}

fn quantization_style_from_u8(value: u8, offset: usize) -> Result<QuantizationStyle> {
    match value & 0x1F {
        0 => Ok(QuantizationStyle::NoQuantization),
        1 => Ok(QuantizationStyle::ScalarDerived),
        2 => Ok(QuantizationStyle::ScalarExpounded),
        _ => Err(J2kError::malformed("QCD/QCC", offset, "invalid quantization style")),
    }
}

fn quantization_style_to_u8(style: QuantizationStyle) -> u8 {
    match style {
        QuantizationStyle::NoQuantization => 0,
        QuantizationStyle::ScalarDerived => 1,
        QuantizationStyle::ScalarExpounded => 2,
    }
}

fn quantization_parameters(
    reader: &mut Reader,
    style: QuantizationStyle,
    remaining_bytes: usize,
    offset: usize,
) -> Result<Vec<(u8, u16)>> {
    let missing = || J2kError::truncated(offset, "quantization step sizes");
    let mut step_sizes = Vec::new();

    match style {
        QuantizationStyle::NoQuantization => {
            for _ in 0..remaining_bytes {
                let value = reader.read_byte().ok_or_else(missing)?;
                step_sizes.push((value >> 3, 0));
            }
        }
        QuantizationStyle::ScalarDerived => {
            let value = reader.read_u16().ok_or_else(missing)?;
            step_sizes.push(((value >> 11) as u8, value & 0x7FF));
        }
        QuantizationStyle::ScalarExpounded => {
            for _ in 0..remaining_bytes / 2 {
                let value = reader.read_u16().ok_or_else(missing)?;
                step_sizes.push(((value >> 11) as u8, value & 0x7FF));
            }
        }
    }

    Ok(step_sizes)
}

fn write_quantization_parameters(writer: &mut Writer, style: QuantizationStyle, step_sizes: &[(u8, u16)]) {
    match style {
        QuantizationStyle::NoQuantization => {
            for &(exponent, _) in step_sizes {
                writer.write_byte(exponent << 3);
            }
        }
        QuantizationStyle::ScalarDerived | QuantizationStyle::ScalarExpounded => {
            for &(exponent, mantissa) in step_sizes {
                writer.write_u16(((exponent as u16) << 11) | (mantissa & 0x7FF));
            }
        }
    }
}

/// QCD marker (A.6.4).
fn qcd_marker(reader: &mut Reader) -> Result<QuantizationInfo> {
    let offset = reader.offset();
    let missing = || J2kError::truncated(offset, "QCD marker");

    let length = reader.read_u16().ok_or_else(missing)?;
    let sqcd = reader.read_byte().ok_or_else(missing)?;
    let style = quantization_style_from_u8(sqcd, offset)?;
    let guard_bits = sqcd >> 5;

    let remaining_bytes = (length as usize)
        .checked_sub(3)
        .ok_or_else(|| J2kError::malformed("QCD", offset, "length field too short"))?;
    let step_sizes = quantization_parameters(reader, style, remaining_bytes, offset)?;

    Ok(QuantizationInfo { quantization_style: style, guard_bits, step_sizes })
}

fn write_qcd_marker(writer: &mut Writer, info: &QuantizationInfo) {
    let length_at = writer.position();
    writer.write_u16(0);
    writer.write_byte(quantization_style_to_u8(info.quantization_style) | (info.guard_bits << 5));
    write_quantization_parameters(writer, info.quantization_style, &info.step_sizes);

    let length = (writer.position() - length_at) as u16;
    writer.patch_u16(length_at, length);
}

/// QCC marker (A.6.5).
fn qcc_marker(reader: &mut Reader, csiz: u16) -> Result<(u16, QuantizationInfo)> {
    let offset = reader.offset();
    let missing = || J2kError::truncated(offset, "QCC marker");

    let length = reader.read_u16().ok_or_else(missing)?;
    let component_index = read_component_index(reader, csiz).ok_or_else(missing)?;
    let sqcc = reader.read_byte().ok_or_else(missing)?;
    let style = quantization_style_from_u8(sqcc, offset)?;
    let guard_bits = sqcc >> 5;

    let component_index_size = if csiz < 257 { 1 } else { 2 };
    let remaining_bytes = (length as usize)
        .checked_sub(2 + component_index_size + 1)
        .ok_or_else(|| J2kError::malformed("QCC", offset, "length field too short"))?;
    let step_sizes = quantization_parameters(reader, style, remaining_bytes, offset)?;

    Ok((component_index, QuantizationInfo { quantization_style: style, guard_bits, step_sizes }))
}

fn write_qcc_marker(writer: &mut Writer, csiz: u16, component_index: u16, info: &QuantizationInfo) {
    let length_at = writer.position();
    writer.write_u16(0);
    write_component_index(writer, csiz, component_index);
    writer.write_byte(quantization_style_to_u8(info.quantization_style) | (info.guard_bits << 5));
    write_quantization_parameters(writer, info.quantization_style, &info.step_sizes);

    let length = (writer.position() - length_at) as u16;
    writer.patch_u16(length_at, length);
}

/// POC marker (A.9.1). Not supported by the teacher at all; entries are
/// repeated back to back until the marker's length field is exhausted.
fn poc_marker(reader: &mut Reader, csiz: u16) -> Result<Vec<PocEntry>> {
    let offset = reader.offset();
    let missing = || J2kError::truncated(offset, "POC marker");

    let length = reader.read_u16().ok_or_else(missing)?;
    let component_field_size: usize = if csiz < 257 { 1 } else { 2 };
    let entry_size = 1 + component_field_size + 2 + 1 + component_field_size + 1;
    let remaining_bytes = (length as usize)
        .checked_sub(2)
        .ok_or_else(|| J2kError::malformed("POC", offset, "length field too short"))?;
    let num_entries = remaining_bytes / entry_size;

    let mut entries = Vec::with_capacity(num_entries);
    for _ in 0..num_entries {
        let resolution_start = reader.read_byte().ok_or_else(missing)? as u16;
        let component_start = read_component_index(reader, csiz).ok_or_else(missing)?;
        let layer_end = reader.read_u16().ok_or_else(missing)?;
        let resolution_end = reader.read_byte().ok_or_else(missing)? as u16;
        let component_end = read_component_index(reader, csiz).ok_or_else(missing)?;
        let progression_order = progression_order_from_u8(reader.read_byte().ok_or_else(missing)?, offset)?;

        entries.push(PocEntry {
            resolution_start,
            component_start,
            layer_end,
            resolution_end,
            component_end,
            progression_order,
        });
    }

    Ok(entries)
}

fn write_poc_marker(writer: &mut Writer, entries: &[PocEntry], csiz: u16) {
    let length_at = writer.position();
    writer.write_u16(0);

    for entry in entries {
        writer.write_byte(entry.resolution_start as u8);
        write_component_index(writer, csiz, entry.component_start);
        writer.write_u16(entry.layer_end);
        writer.write_byte(entry.resolution_end as u8);
        write_component_index(writer, csiz, entry.component_end);
        writer.write_byte(progression_order_to_u8(entry.progression_order));
    }

    let length = (writer.position() - length_at) as u16;
    writer.patch_u16(length_at, length);
}

fn skip_marker_segment(reader: &mut Reader, offset: usize) -> Result<()> {
    let length = reader
        .read_u16()
        .ok_or_else(|| J2kError::truncated(offset, "marker segment length"))?
        .checked_sub(2)
        .ok_or_else(|| J2kError::malformed("marker segment", offset, "length field shorter than itself"))?;
    reader
        .skip_bytes(length as usize)
        .ok_or_else(|| J2kError::truncated(offset, "marker segment body"))
}

/// SOT marker (A.4.2).
fn sot_marker(reader: &mut Reader) -> Result<TilePartHeader> {
    let offset = reader.offset();
    let missing = || J2kError::truncated(offset, "SOT marker");

    let _length = reader.read_u16().ok_or_else(missing)?;
    let tile_index = reader.read_u16().ok_or_else(missing)?;
    let tile_part_length = reader.read_u32().ok_or_else(missing)?;
    let tile_part_index = reader.read_byte().ok_or_else(missing)?;
    let num_tile_parts = reader.read_byte().ok_or_else(missing)?;

    Ok(TilePartHeader { tile_index, tile_part_length, tile_part_index, num_tile_parts })
}

fn write_sot_marker(writer: &mut Writer, header: &TilePartHeader) -> usize {
    writer.write_u16(10); // Lsot: fixed at 10 bytes.
    writer.write_u16(header.tile_index);
    let psot_at = writer.position();
    writer.write_u32(header.tile_part_length);
    writer.write_byte(header.tile_part_index);
    writer.write_byte(header.num_tile_parts);
    psot_at
}

/// Parses every tile-part in the codestream, following the main header.
/// `header_poc_entries` is the image-wide POC override (if any); an
/// individual tile's first tile-part may carry its own POC marker, which
/// replaces it entirely for that tile, the same override pattern COD/COC
/// use.
fn read_tiles<'a>(
    reader: &mut Reader<'a>,
    header: &Header,
    header_poc_entries: &[PocEntry],
) -> Result<Vec<ParsedTile<'a>>> {
    let mut tiles: Vec<ParsedTile<'a>> = (0..header.size_data.num_tiles())
        .map(|idx| ParsedTile {
            tile: Tile::new(idx, header),
            tile_parts: Vec::new(),
            poc_entries: header_poc_entries.to_vec(),
        })
        .collect();

    read_tile_part(reader, header, &mut tiles, true)?;
    while reader.peek_marker() == Some(markers::SOT) {
        read_tile_part(reader, header, &mut tiles, false)?;
    }

    Ok(tiles)
}

fn read_tile_part<'a>(
    reader: &mut Reader<'a>,
    header: &Header,
    tiles: &mut [ParsedTile<'a>],
    first: bool,
) -> Result<()> {
    let sot_offset = reader.offset();
    reader.expect_marker(markers::SOT)?;
    let tile_part_header = sot_marker(reader)?;

    if tile_part_header.tile_index as u32 >= header.size_data.num_tiles() {
        return Err(J2kError::malformed("SOT", sot_offset, "tile index out of range"));
    }

    let data_len = if tile_part_header.tile_part_length == 0 {
        reader.tail().map(|d| d.len()).unwrap_or(0)
    } else {
        (tile_part_header.tile_part_length as usize)
            .checked_sub(12)
            .ok_or_else(|| J2kError::malformed("SOT", sot_offset, "tile-part length shorter than its own header"))?
    };

    let start = reader.offset();
    let parsed = &mut tiles[tile_part_header.tile_index as usize];
    let num_components = parsed.tile.component_infos.len() as u16;

    loop {
        let offset = reader.offset();
        let Some(marker) = reader.peek_marker() else {
            return Err(J2kError::truncated(offset, "marker in tile-part header"));
        };

        match marker {
            markers::SOD => {
                reader.read_marker();
                break;
            }
            markers::COD if first => {
                reader.read_marker();
                let cod = cod_marker(reader)?;
                parsed.tile.mct = cod.mct;
                parsed.tile.num_layers = cod.num_layers;
                parsed.tile.progression_order = cod.progression_order;
                for component in &mut parsed.tile.component_infos {
                    component.coding_style = cod.component_parameters.clone();
                }
            }
            markers::COC if first => {
                reader.read_marker();
                let (component_index, coc) = coc_marker(reader, num_components)?;
                parsed
                    .tile
                    .component_infos
                    .get_mut(component_index as usize)
                    .ok_or_else(|| J2kError::malformed("COC", offset, "component index out of range"))?
                    .coding_style = coc;
            }
            markers::QCD if first => {
                reader.read_marker();
                let qcd = qcd_marker(reader)?;
                for component in &mut parsed.tile.component_infos {
                    component.quantization_info = qcd.clone();
                }
            }
            markers::QCC if first => {
                reader.read_marker();
                let (component_index, qcc) = qcc_marker(reader, num_components)?;
                parsed
                    .tile
                    .component_infos
                    .get_mut(component_index as usize)
                    .ok_or_else(|| J2kError::malformed("QCC", offset, "component index out of range"))?
                    .quantization_info = qcc;
            }
            markers::POC if first => {
                reader.read_marker();
                parsed.poc_entries = poc_marker(reader, num_components)?;
            }
            markers::EOC => break,
            _ => {
                reader.read_marker();
                skip_marker_segment(reader, offset)?;
            }
        }
    }

    let header_bytes = reader.offset() - start;
    let remaining_bytes = data_len
        .checked_sub(header_bytes)
        .ok_or_else(|| J2kError::malformed("SOT", sot_offset, "tile-part length shorter than its header"))?;

    parsed.tile_parts.push(
        reader
            .read_bytes(remaining_bytes)
            .ok_or_else(|| J2kError::truncated(reader.offset(), "tile-part data"))?,
    );

    Ok(())
}

/// One tile-part's worth of packet bytes, already assembled by
/// [`crate::tier2::write_packets`] (or an equivalent caller), ready to be
/// wrapped in SOT/SOD framing.
pub(crate) struct TilePartBody {
    pub(crate) tile_index: u16,
    pub(crate) tile_part_index: u8,
    pub(crate) num_tile_parts: u8,
    pub(crate) packet_bytes: Vec<u8>,
}

/// Writes one tile-part: `SOT` (with Psot backpatched once the length is
/// known), the packet bytes, wrapped after an `SOD` marker. Per-tile-part
/// COD/COC/QCD/QCC overrides are never emitted here: this codec always
/// derives a uniform coding style for the whole image from a single
/// `EncoderConfig`, so per-tile overrides would have no counterpart to
/// reconstruct from and are left to a caller building one by hand.
pub(crate) fn write_tile_part(writer: &mut Writer, body: &TilePartBody) {
    let sot_start = writer.position();
    writer.write_marker(markers::SOT);
    let psot_at = write_sot_marker(
        writer,
        &TilePartHeader {
            tile_index: body.tile_index,
            tile_part_length: 0,
            tile_part_index: body.tile_part_index,
            num_tile_parts: body.num_tile_parts,
        },
    );

    writer.write_marker(markers::SOD);
    writer.write_bytes(&body.packet_bytes);

    let psot = (writer.position() - sot_start) as u32;
    writer.patch_u32(psot_at, psot);
}

pub(crate) fn write_eoc(writer: &mut Writer) {
    writer.write_marker(markers::EOC);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        let parameters = CodingStyleParameters {
            num_decomposition_levels: 2,
            num_resolution_levels: 3,
            code_block_width: 6,
            code_block_height: 6,
            code_block_style: CodeBlockStyle::default(),
            transformation: WaveletTransform::Reversible53,
            precinct_exponents: vec![(15, 15); 3],
        };

        let global_coding_style = CodingStyleDefault {
            progression_order: ProgressionOrder::LayerResolutionComponentPosition,
            num_layers: 1,
            mct: false,
            component_parameters: CodingStyleComponent { flags: CodingStyleFlags::default(), parameters },
        };

        let size_data = SizeData {
            reference_grid_width: 64,
            reference_grid_height: 64,
            image_area_x_offset: 0,
            image_area_y_offset: 0,
            tile_width: 64,
            tile_height: 64,
            tile_x_offset: 0,
            tile_y_offset: 0,
            component_sizes: vec![ComponentSizeInfo {
                precision: 8,
                is_signed: false,
                horizontal_resolution: 1,
                vertical_resolution: 1,
            }],
        };

        let component_infos = vec![ComponentInfo {
            size_info: size_data.component_sizes[0],
            coding_style: global_coding_style.component_parameters.clone(),
            quantization_info: QuantizationInfo {
                quantization_style: QuantizationStyle::NoQuantization,
                guard_bits: 2,
                step_sizes: vec![(8, 0); 7],
            },
        }];

        Header { size_data, global_coding_style, component_infos }
    }

    #[test]
    fn size_marker_round_trips() {
        let header = sample_header();
        let mut writer = Writer::new();
        write_size_marker(&mut writer, &header.size_data);

        let bytes = writer.into_bytes();
        let mut reader = Reader::new(&bytes);
        let read_back = size_marker(&mut reader).unwrap();

        assert_eq!(read_back.reference_grid_width, header.size_data.reference_grid_width);
        assert_eq!(read_back.component_sizes.len(), 1);
        assert_eq!(read_back.component_sizes[0].precision, 8);
    }

    #[test]
    fn cod_marker_round_trips_precinct_exponents() {
        let header = sample_header();
        let mut writer = Writer::new();
        write_cod_marker(&mut writer, &header.global_coding_style);

        let bytes = writer.into_bytes();
        let mut reader = Reader::new(&bytes);
        let read_back = cod_marker(&mut reader).unwrap();

        assert_eq!(read_back.progression_order, header.global_coding_style.progression_order);
        assert_eq!(
            read_back.component_parameters.parameters.precinct_exponents,
            header.global_coding_style.component_parameters.parameters.precinct_exponents
        );
    }

    #[test]
    fn qcd_marker_round_trips_expounded_step_sizes() {
        let info = QuantizationInfo {
            quantization_style: QuantizationStyle::ScalarExpounded,
            guard_bits: 3,
            step_sizes: vec![(5, 100), (6, 200), (6, 300)],
        };

        let mut writer = Writer::new();
        write_qcd_marker(&mut writer, &info);

        let bytes = writer.into_bytes();
        let mut reader = Reader::new(&bytes);
        let read_back = qcd_marker(&mut reader).unwrap();

        assert_eq!(read_back.guard_bits, 3);
        assert_eq!(read_back.step_sizes, info.step_sizes);
    }

    #[test]
    fn poc_marker_round_trips_multiple_entries() {
        let entries = vec![
            PocEntry {
                resolution_start: 0,
                component_start: 0,
                layer_end: 1,
                resolution_end: 2,
                component_end: 1,
                progression_order: ProgressionOrder::ResolutionLayerComponentPosition,
            },
            PocEntry {
                resolution_start: 2,
                component_start: 0,
                layer_end: 1,
                resolution_end: 3,
                component_end: 1,
                progression_order: ProgressionOrder::LayerResolutionComponentPosition,
            },
        ];

        let mut writer = Writer::new();
        write_poc_marker(&mut writer, &entries, 1);

        let bytes = writer.into_bytes();
        let mut reader = Reader::new(&bytes);
        let read_back = poc_marker(&mut reader, 1).unwrap();

        assert_eq!(read_back.len(), 2);
        assert_eq!(read_back[1].resolution_start, 2);
        assert_eq!(read_back[1].progression_order, ProgressionOrder::LayerResolutionComponentPosition);
    }

    #[test]
    fn full_header_plus_single_tile_part_round_trips() {
        let header = sample_header();
        let mut writer = Writer::new();
        write_header(&mut writer, &header, &[]);

        write_tile_part(
            &mut writer,
            &TilePartBody { tile_index: 0, tile_part_index: 0, num_tile_parts: 1, packet_bytes: vec![1, 2, 3, 4] },
        );
        write_eoc(&mut writer);

        let bytes = writer.into_bytes();
        let (read_header, tiles) = read(&bytes).unwrap();

        assert_eq!(read_header.component_infos.len(), 1);
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].tile_parts[0], &[1, 2, 3, 4]);
    }

    #[test]
    fn missing_eoc_is_an_error() {
        let header = sample_header();
        let mut writer = Writer::new();
        write_header(&mut writer, &header, &[]);
        write_tile_part(
            &mut writer,
            &TilePartBody { tile_index: 0, tile_part_index: 0, num_tile_parts: 1, packet_bytes: vec![9] },
        );

        let bytes = writer.into_bytes();
        assert!(read(&bytes).is_err());
    }
}
