//! Bit-plane coding, described in Annex D: the EBCOT Tier-1 entropy coder
//! that turns (or recovers) the magnitude and sign of each coefficient in a
//! code-block via context-adaptive arithmetic coding.
//!
//! The decode side below mirrors the bitplane scan, the three coding passes
//! (significance propagation, magnitude refinement, cleanup) and the context
//! label tables D.1-D.4/D.7 bit for bit. The encode side drives the same
//! state machine in the opposite direction: instead of asking the arithmetic
//! decoder "what bit comes next", it already knows the ground-truth
//! magnitude and sign of every coefficient and asks the arithmetic encoder
//! to commit each bit in the same scan order, so that running the decode
//! side over its output reconstructs the original coefficients exactly.

use crate::bit_reader::BitReader;
use crate::bit_writer::BitWriter;
use crate::image::{CodeBlock, CodeBlockStyle, Layer, Segment, SubBandType};
use crate::mq::{self, MqContext};
#[cfg(feature = "logging")]
use log::warn;

// We only allow 31 bit planes because we need one bit for the sign.
pub(crate) const BITPLANE_BIT_SIZE: u32 = size_of::<u32>() as u32 * 8 - 1;

const SIGNIFICANCE_SHIFT: u8 = 7;
const HAS_MAGNITUDE_REFINEMENT_SHIFT: u8 = 6;
const HAS_ZERO_CODING_SHIFT: u8 = 5;
const BITPLANE_COUNT_MASK: u8 = (1 << 5) - 1;

/// From MSB to LSB: significance state, whether a magnitude-refinement pass
/// has previously touched this coefficient, whether it was already zero
/// coded during the current bitplane's significance-propagation pass
/// (reset every time we move to a new bitplane), and the running count of
/// magnitude bits accumulated so far.
#[derive(Default, Copy, Clone)]
struct CoefficientState(u8);

impl CoefficientState {
    #[inline(always)]
    fn set_bit(&mut self, shift: u8, value: u8) {
        self.0 &= !(1u8 << shift);
        self.0 |= value << shift;
    }

    #[inline(always)]
    fn set_significant(&mut self) {
        self.set_bit(SIGNIFICANCE_SHIFT, 1);
    }

    #[inline(always)]
    fn set_zero_coded(&mut self, value: u8) {
        self.set_bit(HAS_ZERO_CODING_SHIFT, value & 1);
    }

    #[inline(always)]
    fn set_magnitude_refined(&mut self) {
        self.set_bit(HAS_MAGNITUDE_REFINEMENT_SHIFT, 1);
    }

    #[inline(always)]
    fn is_significant(&self) -> bool {
        (self.0 >> SIGNIFICANCE_SHIFT) & 1 == 1
    }

    #[inline(always)]
    fn is_magnitude_refined(&self) -> bool {
        (self.0 >> HAS_MAGNITUDE_REFINEMENT_SHIFT) & 1 == 1
    }

    #[inline(always)]
    fn is_zero_coded(&self) -> bool {
        (self.0 >> HAS_ZERO_CODING_SHIFT) & 1 == 1
    }

    #[inline(always)]
    fn num_bitplanes(&self) -> u8 {
        self.0 & BITPLANE_COUNT_MASK
    }

    #[inline(always)]
    fn set_magnitude_bits(&mut self, count: u8) {
        self.0 = (self.0 & !BITPLANE_COUNT_MASK) | (count & BITPLANE_COUNT_MASK);
    }
}

/// Sign packed into the top bit, magnitude bits accumulated from the MSB
/// down in the rest.
#[derive(Copy, Clone, Debug, Default)]
struct Coefficient(u32);

impl Coefficient {
    fn get(&self) -> i32 {
        let mut magnitude = (self.0 & !0x8000_0000) as i32;
        if self.has_sign() {
            magnitude = -magnitude;
        }
        magnitude
    }

    fn set_sign(&mut self, sign: u8) {
        self.0 |= (sign as u32) << 31;
    }

    fn has_sign(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    fn push_bit(&mut self, bit: u32) {
        let sign = self.0 & 0x8000_0000;
        self.0 = sign | ((self.0 << 1) | bit);
    }
}

#[derive(Default, Copy, Clone, Debug)]
struct Position {
    x: u32,
    y: u32,
}

impl Position {
    fn new(x: u32, y: u32) -> Position {
        Self { x, y }
    }

    fn index(&self, width: u32) -> usize {
        self.x as usize + self.y as usize * width as usize
    }
}

/// Each bit-plane is scanned in stripes of four rows: the first four
/// coefficients of the first column, then the first four of the second
/// column, and so on to the right edge, before returning to scan the next
/// stripe of rows (D.2).
fn for_each_position(width: u32, height: u32, mut action: impl FnMut(&mut Position)) {
    for base_row in (0..height).step_by(4) {
        for x in 0..width {
            let mut cur_pos = Position::new(x, base_row);
            while cur_pos.y < (base_row + 4).min(height) {
                action(&mut cur_pos);
                cur_pos.y += 1;
            }
        }
    }
}

/// State shared by the decode and encode directions: per-coefficient
/// significance/refinement bookkeeping and the 19 arithmetic-coding
/// contexts (Table C.2 / D.7), plus the neighborhood queries both directions
/// need to compute context labels.
struct CodeBlockState {
    coefficient_states: Vec<CoefficientState>,
    coefficients: Vec<Coefficient>,
    width: u32,
    height: u32,
    vertically_causal: bool,
    sub_band_type: SubBandType,
    contexts: [MqContext; 19],
}

impl CodeBlockState {
    fn new(width: u32, height: u32, sub_band_type: SubBandType, vertically_causal: bool, missing_bit_planes: u8) -> Self {
        let num_coefficients = width as usize * height as usize;
        let mut coefficient_states = vec![CoefficientState::default(); num_coefficients];
        for state in &mut coefficient_states {
            state.set_magnitude_bits(missing_bit_planes);
        }

        let mut state = Self {
            coefficient_states,
            coefficients: vec![Coefficient::default(); num_coefficients],
            width,
            height,
            vertically_causal,
            sub_band_type,
            contexts: [MqContext::default(); 19],
        };
        state.reset_contexts();
        state
    }

    fn mq_context(&mut self, ctx_label: u8) -> &mut MqContext {
        &mut self.contexts[ctx_label as usize]
    }

    /// Initial context states, Table D.7.
    fn reset_contexts(&mut self) {
        for context in &mut self.contexts {
            context.mps = 0;
            context.index = 0;
        }
        self.contexts[0] = mq::initial_context(0);
        self.contexts[17] = mq::initial_context(17);
        self.contexts[18] = mq::initial_context(18);
    }

    fn reset_for_next_bitplane(&mut self) {
        for el in &mut self.coefficient_states {
            el.set_zero_coded(0);
        }
    }

    fn set_sign(&mut self, pos: &Position, sign: u8) {
        self.coefficients[pos.index(self.width)].set_sign(sign);
    }

    fn significance_state(&self, position: &Position) -> u8 {
        u8::from(self.coefficient_states[position.index(self.width)].is_significant())
    }

    fn is_significant(&self, position: &Position) -> bool {
        self.significance_state(position) != 0
    }

    fn set_significant(&mut self, position: &Position) {
        self.coefficient_states[position.index(self.width)].set_significant();
    }

    fn set_zero_coded(&mut self, position: &Position) {
        self.coefficient_states[position.index(self.width)].set_zero_coded(1);
    }

    fn set_magnitude_refined(&mut self, position: &Position) {
        self.coefficient_states[position.index(self.width)].set_magnitude_refined();
    }

    fn is_magnitude_refined(&self, position: &Position) -> bool {
        self.coefficient_states[position.index(self.width)].is_magnitude_refined()
    }

    fn is_zero_coded(&self, position: &Position) -> bool {
        self.coefficient_states[position.index(self.width)].is_zero_coded()
    }

    fn push_magnitude_bit(&mut self, position: &Position, bit: u32) {
        let idx = position.index(self.width);
        let count = self.coefficient_states[idx].num_bitplanes();
        self.coefficients[idx].push_bit(bit);
        self.coefficient_states[idx].set_magnitude_bits(count + 1);
    }

    #[inline]
    fn sign_checked(&self, x: i64, y: i64) -> u8 {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            0
        } else if self.coefficients[x as usize + y as usize * self.width as usize].has_sign() {
            1
        } else {
            0
        }
    }

    #[inline]
    fn significance_state_checked(&self, x: i64, y: i64) -> u8 {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            0
        } else {
            self.significance_state(&Position::new(x as u32, y as u32))
        }
    }

    #[inline]
    fn neighbor_in_next_stripe(&self, pos: &Position, neighbor_y: u32) -> bool {
        neighbor_y < self.height && (neighbor_y >> 2) > (pos.y >> 2)
    }

    #[inline]
    fn horizontal_significance_states(&self, pos: &Position) -> u8 {
        self.significance_state_checked(pos.x as i64 - 1, pos.y as i64)
            + self.significance_state_checked(pos.x as i64 + 1, pos.y as i64)
    }

    #[inline]
    fn vertical_significance_states(&self, pos: &Position) -> u8 {
        let suppress_lower = self.vertically_causal && self.neighbor_in_next_stripe(pos, pos.y + 1);
        self.significance_state_checked(pos.x as i64, pos.y as i64 - 1)
            + if suppress_lower { 0 } else { self.significance_state_checked(pos.x as i64, pos.y as i64 + 1) }
    }

    #[inline(always)]
    fn diagonal_significance_states(&self, pos: &Position) -> u8 {
        let suppress_lower = self.vertically_causal && self.neighbor_in_next_stripe(pos, pos.y + 1);
        self.significance_state_checked(pos.x as i64 - 1, pos.y as i64 - 1)
            + self.significance_state_checked(pos.x as i64 + 1, pos.y as i64 - 1)
            + if suppress_lower { 0 } else { self.significance_state_checked(pos.x as i64 - 1, pos.y as i64 + 1) }
            + if suppress_lower { 0 } else { self.significance_state_checked(pos.x as i64 + 1, pos.y as i64 + 1) }
    }

    #[inline]
    fn neighborhood_significance_states(&self, pos: &Position) -> u8 {
        self.horizontal_significance_states(pos) + self.vertical_significance_states(pos) + self.diagonal_significance_states(pos)
    }
}

/// Context label for zero coding (D.3.1, Tables D.1/D.3).
#[inline(always)]
fn context_label_zero_coding(pos: &Position, state: &CodeBlockState) -> u8 {
    let mut horizontal = state.horizontal_significance_states(pos);
    let mut vertical = state.vertical_significance_states(pos);
    let diagonal = state.diagonal_significance_states(pos);

    match state.sub_band_type {
        SubBandType::LowLow | SubBandType::LowHigh | SubBandType::HighLow => {
            if state.sub_band_type == SubBandType::HighLow {
                std::mem::swap(&mut horizontal, &mut vertical);
            }

            if horizontal == 2 {
                8
            } else if horizontal == 1 && vertical >= 1 {
                7
            } else if horizontal == 1 && vertical == 0 && diagonal >= 1 {
                6
            } else if horizontal == 1 && vertical == 0 && diagonal == 0 {
                5
            } else if horizontal == 0 && vertical == 2 {
                4
            } else if horizontal == 0 && vertical == 1 {
                3
            } else if horizontal == 0 && vertical == 0 && diagonal >= 2 {
                2
            } else if horizontal == 0 && vertical == 0 && diagonal == 1 {
                1
            } else {
                0
            }
        }
        SubBandType::HighHigh => {
            let hv = horizontal + vertical;

            if diagonal >= 3 {
                8
            } else if hv >= 1 && diagonal == 2 {
                7
            } else if hv == 0 && diagonal == 2 {
                6
            } else if hv >= 2 && diagonal == 1 {
                5
            } else if hv == 1 && diagonal == 1 {
                4
            } else if hv == 0 && diagonal == 1 {
                3
            } else if hv >= 2 && diagonal == 0 {
                2
            } else if hv == 1 && diagonal == 0 {
                1
            } else {
                0
            }
        }
    }
}

/// Context label for magnitude refinement coding (Table D.4).
fn context_label_magnitude_refinement_coding(pos: &Position, state: &CodeBlockState) -> u8 {
    if state.is_magnitude_refined(pos) {
        16
    } else {
        let summed = state.horizontal_significance_states(pos) + state.vertical_significance_states(pos) + state.diagonal_significance_states(pos);
        if summed >= 1 { 15 } else { 14 }
    }
}

/// Context label and XOR prediction bit for sign coding (D.3.2, Table D.2).
#[inline(always)]
fn context_label_sign_coding(pos: &Position, state: &CodeBlockState) -> (u8, u8) {
    #[inline(always)]
    fn neighbor_contribution(state: &CodeBlockState, x: i64, y: i64) -> i32 {
        let sigma = state.significance_state_checked(x, y);
        let multiplied = if state.sign_checked(x, y) == 0 { 1 } else { -1 };
        multiplied * sigma as i32
    }

    let h = (neighbor_contribution(state, pos.x as i64 - 1, pos.y as i64) + neighbor_contribution(state, pos.x as i64 + 1, pos.y as i64)).clamp(-1, 1);
    let suppress_lower = state.vertically_causal && state.neighbor_in_next_stripe(pos, pos.y + 1);
    let v = (neighbor_contribution(state, pos.x as i64, pos.y as i64 - 1)
        + if suppress_lower { 0 } else { neighbor_contribution(state, pos.x as i64, pos.y as i64 + 1) })
    .clamp(-1, 1);

    match (h, v) {
        (1, 1) => (13, 0),
        (1, 0) => (12, 0),
        (1, -1) => (11, 0),
        (0, 1) => (10, 0),
        (0, 0) => (9, 0),
        (0, -1) => (10, 1),
        (-1, 1) => (11, 1),
        (-1, 0) => (12, 1),
        (-1, -1) => (13, 1),
        _ => unreachable!(),
    }
}

// ---------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------

trait BitDecoder {
    const IS_BYPASS: bool;
    fn read_bit(&mut self, context: &mut MqContext) -> u32;
}

impl BitDecoder for mq::Decoder<'_> {
    const IS_BYPASS: bool = false;
    fn read_bit(&mut self, context: &mut MqContext) -> u32 {
        mq::Decoder::read_bit(self, context)
    }
}

struct BypassDecoder<'a>(BitReader<'a>);

impl<'a> BypassDecoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self(BitReader::new(data))
    }
}

impl BitDecoder for BypassDecoder<'_> {
    const IS_BYPASS: bool = true;
    fn read_bit(&mut self, _: &mut MqContext) -> u32 {
        self.0.read_bits_with_stuffing(1).unwrap_or_else(|| {
            #[cfg(feature = "logging")]
            warn!("exceeded buffer in by-pass decoder");
            1
        })
    }
}

#[derive(Default)]
pub(crate) struct BitPlaneDecodeBuffers {
    combined_layers: Vec<u8>,
    segment_ranges: Vec<usize>,
    segment_coding_passes: Vec<u32>,
}

impl BitPlaneDecodeBuffers {
    fn reset(&mut self) {
        self.combined_layers.clear();
        self.segment_ranges.clear();
        self.segment_ranges.push(0);
        self.segment_coding_passes.clear();
        self.segment_coding_passes.push(0);
    }
}

#[derive(Default)]
pub(crate) struct CodeBlockDecodeResult {
    coefficients: Vec<Coefficient>,
}

impl CodeBlockDecodeResult {
    pub(crate) fn coefficients(&self) -> impl Iterator<Item = i32> + '_ {
        self.coefficients.iter().map(Coefficient::get)
    }
}

/// Decode all layers of a code-block into signed integer coefficients.
#[allow(clippy::too_many_arguments)]
pub(crate) fn decode(
    code_block: &CodeBlock,
    sub_band_type: SubBandType,
    num_bitplanes: u8,
    style: &CodeBlockStyle,
    bp_buffers: &mut BitPlaneDecodeBuffers,
    layers: &[Layer],
    all_segments: &[Segment],
) -> Result<CodeBlockDecodeResult, &'static str> {
    let mut state = CodeBlockState::new(
        code_block.rect.width(),
        code_block.rect.height(),
        sub_band_type,
        style.vertically_causal_context,
        code_block.missing_bit_planes,
    );

    if code_block.number_of_coding_passes == 0 {
        return Ok(CodeBlockDecodeResult { coefficients: state.coefficients });
    }

    if code_block.missing_bit_planes as u32 + 1 + (code_block.number_of_coding_passes - 1).div_ceil(3) > num_bitplanes as u32 {
        return Err("mismatch between indicated number of bitplanes and actual ones");
    }

    if num_bitplanes as u32 > BITPLANE_BIT_SIZE {
        return Err("number of bitplanes is too high");
    }

    decode_inner(code_block, style, num_bitplanes, layers, all_segments, &mut state, bp_buffers).ok_or("failed to decode code-block arithmetic data")?;

    Ok(CodeBlockDecodeResult { coefficients: state.coefficients })
}

fn decode_inner(
    code_block: &CodeBlock,
    style: &CodeBlockStyle,
    num_bitplanes: u8,
    layers: &[Layer],
    all_segments: &[Segment],
    state: &mut CodeBlockState,
    bp_buffers: &mut BitPlaneDecodeBuffers,
) -> Option<()> {
    bp_buffers.reset();

    let mut last_segment_idx = 0;
    let mut coding_passes = 0;

    for layer in layers {
        if let Some(range) = layer.segments.clone() {
            for segment in &all_segments[range] {
                if segment.idx != last_segment_idx {
                    assert_eq!(segment.idx, last_segment_idx + 1);
                    bp_buffers.segment_ranges.push(bp_buffers.combined_layers.len());
                    bp_buffers.segment_coding_passes.push(coding_passes);
                    last_segment_idx += 1;
                }

                bp_buffers.combined_layers.extend(segment.data);
                coding_passes += segment.coding_passes;
            }
        }
    }

    assert_eq!(coding_passes, code_block.number_of_coding_passes);

    bp_buffers.segment_ranges.push(bp_buffers.combined_layers.len());
    bp_buffers.segment_coding_passes.push(coding_passes);

    let is_normal_mode = !style.selective_arithmetic_coding_bypass && !style.termination_on_each_pass;

    if is_normal_mode {
        let mut decoder = mq::Decoder::new(&bp_buffers.combined_layers);
        handle_coding_passes(0, code_block.number_of_coding_passes, style, state, &mut decoder)?;
    } else {
        for segment in 0..bp_buffers.segment_coding_passes.len() - 1 {
            let start_coding_pass = bp_buffers.segment_coding_passes[segment];
            let end_coding_pass = bp_buffers.segment_coding_passes[segment + 1];
            let data = &bp_buffers.combined_layers[bp_buffers.segment_ranges[segment]..bp_buffers.segment_ranges[segment + 1]];

            let use_arithmetic = if style.selective_arithmetic_coding_bypass {
                start_coding_pass <= 9 || start_coding_pass.is_multiple_of(3)
            } else {
                true
            };

            if use_arithmetic {
                let mut decoder = mq::Decoder::new(data);
                handle_coding_passes(start_coding_pass, end_coding_pass, style, state, &mut decoder)?;
            } else {
                let mut decoder = BypassDecoder::new(data);
                handle_coding_passes(start_coding_pass, end_coding_pass, style, state, &mut decoder)?;
            }
        }
    }

    for (coefficient, coefficient_state) in state.coefficients.iter_mut().zip(state.coefficient_states.iter().copied()) {
        let count = coefficient_state.num_bitplanes();
        for _ in 0..(num_bitplanes - count) {
            coefficient.push_bit(0);
        }
    }

    Some(())
}

fn handle_coding_passes(start: u32, end: u32, style: &CodeBlockStyle, state: &mut CodeBlockState, decoder: &mut impl BitDecoder) -> Option<()> {
    for coding_pass in start..end {
        match coding_pass % 3 {
            0 => {
                cleanup_pass(state, decoder);

                if style.segmentation_symbols {
                    let b0 = decoder.read_bit(state.mq_context(18));
                    let b1 = decoder.read_bit(state.mq_context(18));
                    let b2 = decoder.read_bit(state.mq_context(18));
                    let b3 = decoder.read_bit(state.mq_context(18));

                    if b0 != 1 || b1 != 0 || b2 != 1 || b3 != 0 {
                        #[cfg(feature = "logging")]
                        warn!("encountered invalid segmentation symbol");
                        return None;
                    }
                }

                state.reset_for_next_bitplane();
            }
            1 => significance_propagation_pass_decode(state, decoder),
            2 => magnitude_refinement_pass_decode(state, decoder),
            _ => unreachable!(),
        }

        if style.reset_context_probabilities {
            state.reset_contexts();
        }
    }

    Some(())
}

fn cleanup_pass(state: &mut CodeBlockState, decoder: &mut impl BitDecoder) {
    for_each_position(state.width, state.height, |cur_pos| {
        if !state.is_significant(cur_pos) && !state.is_zero_coded(cur_pos) {
            let use_rl = cur_pos.y % 4 == 0
                && (state.height - cur_pos.y) >= 4
                && state.neighborhood_significance_states(cur_pos) == 0
                && state.neighborhood_significance_states(&Position::new(cur_pos.x, cur_pos.y + 1)) == 0
                && state.neighborhood_significance_states(&Position::new(cur_pos.x, cur_pos.y + 2)) == 0
                && state.neighborhood_significance_states(&Position::new(cur_pos.x, cur_pos.y + 3)) == 0;

            let bit = if use_rl {
                let bit = decoder.read_bit(state.mq_context(17));

                if bit == 0 {
                    state.push_magnitude_bit(cur_pos, 0);
                    for _ in 0..3 {
                        cur_pos.y += 1;
                        state.push_magnitude_bit(cur_pos, 0);
                    }
                    return;
                } else {
                    let mut num_zeroes = decoder.read_bit(state.mq_context(18));
                    num_zeroes = (num_zeroes << 1) | decoder.read_bit(state.mq_context(18));

                    for _ in 0..num_zeroes {
                        state.push_magnitude_bit(cur_pos, 0);
                        cur_pos.y += 1;
                    }

                    1
                }
            } else {
                let ctx_label = context_label_zero_coding(cur_pos, state);
                decoder.read_bit(state.mq_context(ctx_label))
            };

            state.push_magnitude_bit(cur_pos, bit);

            if bit == 1 {
                decode_sign_bit(cur_pos, state, decoder);
                state.set_significant(cur_pos);
            }
        }
    });
}

fn significance_propagation_pass_decode(state: &mut CodeBlockState, decoder: &mut impl BitDecoder) {
    for_each_position(state.width, state.height, |cur_pos| {
        if !state.is_significant(cur_pos) && state.neighborhood_significance_states(cur_pos) != 0 {
            let ctx_label = context_label_zero_coding(cur_pos, state);
            let bit = decoder.read_bit(state.mq_context(ctx_label));
            state.push_magnitude_bit(cur_pos, bit);
            state.set_zero_coded(cur_pos);

            if bit == 1 {
                decode_sign_bit(cur_pos, state, decoder);
                state.set_significant(cur_pos);
            }
        }
    });
}

fn magnitude_refinement_pass_decode(state: &mut CodeBlockState, decoder: &mut impl BitDecoder) {
    for_each_position(state.width, state.height, |cur_pos| {
        if state.is_significant(cur_pos) && !state.is_zero_coded(cur_pos) {
            let ctx_label = context_label_magnitude_refinement_coding(cur_pos, state);
            let bit = decoder.read_bit(state.mq_context(ctx_label));
            state.push_magnitude_bit(cur_pos, bit);
            state.set_magnitude_refined(cur_pos);
        }
    });
}

#[inline(always)]
fn decode_sign_bit<T: BitDecoder>(pos: &Position, state: &mut CodeBlockState, decoder: &mut T) {
    let (ctx_label, xor_bit) = context_label_sign_coding(pos, state);
    let sign_bit = if T::IS_BYPASS {
        decoder.read_bit(state.mq_context(ctx_label))
    } else {
        decoder.read_bit(state.mq_context(ctx_label)) ^ xor_bit as u32
    };
    state.set_sign(pos, sign_bit as u8);
}

// ---------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------

trait BitEncoder {
    const IS_BYPASS: bool;
    fn write_bit(&mut self, bit: u32, context: &mut MqContext);
}

impl BitEncoder for mq::Encoder {
    const IS_BYPASS: bool = false;
    fn write_bit(&mut self, bit: u32, context: &mut MqContext) {
        mq::Encoder::write_bit(self, bit, context)
    }
}

struct BypassEncoder(BitWriter);

impl BypassEncoder {
    fn new() -> Self {
        Self(BitWriter::new())
    }

    fn finish(self) -> Vec<u8> {
        self.0.finish()
    }
}

impl BitEncoder for BypassEncoder {
    const IS_BYPASS: bool = true;
    fn write_bit(&mut self, bit: u32, _: &mut MqContext) {
        self.0.write_bit_with_stuffing(bit);
    }
}

/// The ground truth a code-block is encoded from: a sign-magnitude value per
/// coefficient, laid out row-major like [`CodeBlockState`]'s own storage.
pub(crate) struct CodeBlockSource<'a> {
    pub(crate) values: &'a [i32],
    pub(crate) width: u32,
    pub(crate) height: u32,
}

impl CodeBlockSource<'_> {
    fn magnitude(&self, pos: &Position) -> u32 {
        self.values[pos.index(self.width)].unsigned_abs()
    }

    fn sign(&self, pos: &Position) -> u8 {
        u8::from(self.values[pos.index(self.width)] < 0)
    }

    /// Bit of `|value|` at `plane` counted from the coded MSB (`plane == 0`)
    /// down to the coded LSB (`plane == top_bitplane`).
    fn bit_at(&self, pos: &Position, top_bitplane: u8, plane: u8) -> u32 {
        (self.magnitude(pos) >> (top_bitplane - plane)) & 1
    }
}

/// The number of coded bit-planes and the resulting pass count for a
/// code-block whose maximum magnitude is `max_magnitude`, given the sub-band
/// carries up to `num_bitplanes` planes in total (Annex E's `M_b`).
///
/// Returns `(missing_bit_planes, number_of_coding_passes, top_bitplane)`.
fn plane_layout(max_magnitude: u32, num_bitplanes: u8) -> (u8, u32, u8) {
    if max_magnitude == 0 {
        return (num_bitplanes, 0, 0);
    }

    let bits_needed = 32 - max_magnitude.leading_zeros();
    let missing_bit_planes = num_bitplanes.saturating_sub(bits_needed as u8);
    let planes_coded = num_bitplanes - missing_bit_planes;
    let number_of_coding_passes = 3 * planes_coded as u32 - 2;
    let top_bitplane = planes_coded - 1;

    (missing_bit_planes, number_of_coding_passes, top_bitplane)
}

pub(crate) struct EncodedCodeBlock {
    pub(crate) segments: Vec<Vec<u8>>,
    pub(crate) coding_passes_per_segment: Vec<u32>,
    pub(crate) missing_bit_planes: u8,
    pub(crate) number_of_coding_passes: u32,
    /// Cumulative byte length of `segments` concatenated, after each coding
    /// pass 0..number_of_coding_passes (inclusive). In normal mode this is a
    /// checkpoint into the single still-open MQ stream, taken before FLUSH;
    /// rate control uses it to find a truncation point's byte cost without
    /// re-encoding. The very last entry is corrected to the true, flushed
    /// length. In segmented modes it's just the running sum of segment
    /// lengths, since each segment there is already exactly one pass.
    pub(crate) pass_byte_lengths: Vec<u32>,
}

/// Encode a single code-block's coefficients into one or more entropy-coded
/// segments, mirroring [`decode`] in reverse.
pub(crate) fn encode(source: &CodeBlockSource, sub_band_type: SubBandType, num_bitplanes: u8, style: &CodeBlockStyle) -> EncodedCodeBlock {
    let max_magnitude = source.values.iter().map(|v| v.unsigned_abs()).max().unwrap_or(0);
    let (missing_bit_planes, number_of_coding_passes, top_bitplane) = plane_layout(max_magnitude, num_bitplanes);

    if number_of_coding_passes == 0 {
        return EncodedCodeBlock {
            segments: vec![],
            coding_passes_per_segment: vec![],
            missing_bit_planes,
            number_of_coding_passes: 0,
            pass_byte_lengths: vec![],
        };
    }

    let mut state = CodeBlockState::new(source.width, source.height, sub_band_type, style.vertically_causal_context, missing_bit_planes);

    let is_normal_mode = !style.selective_arithmetic_coding_bypass && !style.termination_on_each_pass;

    let mut segments = Vec::new();
    let mut coding_passes_per_segment = Vec::new();
    let mut pass_byte_lengths = Vec::with_capacity(number_of_coding_passes as usize);

    if is_normal_mode {
        let mut encoder = mq::Encoder::new();
        for pass in 0..number_of_coding_passes {
            handle_coding_passes_encode(pass, pass + 1, style, &mut state, source, top_bitplane, &mut encoder);
            pass_byte_lengths.push(encoder.byte_len() as u32);
        }
        let segment = encoder.finish();
        if let Some(last) = pass_byte_lengths.last_mut() {
            *last = segment.len() as u32;
        }
        coding_passes_per_segment.push(number_of_coding_passes);
        segments.push(segment);
    } else {
        let mut pass = 0;
        let mut cumulative = 0u32;
        while pass < number_of_coding_passes {
            let use_arithmetic = if style.selective_arithmetic_coding_bypass {
                pass <= 9 || pass.is_multiple_of(3)
            } else {
                true
            };

            // Both segmented modes introduce a termination after every
            // single coding pass (selective bypass always; termination-on-
            // each-pass by definition).
            let end = (pass + 1).min(number_of_coding_passes);

            let segment = if use_arithmetic {
                let mut encoder = mq::Encoder::new();
                handle_coding_passes_encode(pass, end, style, &mut state, source, top_bitplane, &mut encoder);
                encoder.finish()
            } else {
                let mut encoder = BypassEncoder::new();
                handle_coding_passes_encode(pass, end, style, &mut state, source, top_bitplane, &mut encoder);
                encoder.finish()
            };
            cumulative += segment.len() as u32;
            pass_byte_lengths.push(cumulative);
            segments.push(segment);
            coding_passes_per_segment.push(end - pass);
            pass = end;
        }
    }

    EncodedCodeBlock { segments, coding_passes_per_segment, missing_bit_planes, number_of_coding_passes, pass_byte_lengths }
}

#[allow(clippy::too_many_arguments)]
fn handle_coding_passes_encode(
    start: u32,
    end: u32,
    style: &CodeBlockStyle,
    state: &mut CodeBlockState,
    source: &CodeBlockSource,
    top_bitplane: u8,
    encoder: &mut impl BitEncoder,
) {
    for coding_pass in start..end {
        // `coding_pass / 3` counts completed bitplanes; the current plane is
        // the one being coded right now, counting down from `top_bitplane`.
        let plane = top_bitplane.saturating_sub((coding_pass / 3) as u8);

        match coding_pass % 3 {
            0 => {
                cleanup_pass_encode(state, source, top_bitplane, plane, encoder);

                if style.segmentation_symbols {
                    encoder.write_bit(1, state.mq_context(18));
                    encoder.write_bit(0, state.mq_context(18));
                    encoder.write_bit(1, state.mq_context(18));
                    encoder.write_bit(0, state.mq_context(18));
                }

                state.reset_for_next_bitplane();
            }
            1 => significance_propagation_pass_encode(state, source, top_bitplane, plane, encoder),
            2 => magnitude_refinement_pass_encode(state, source, top_bitplane, plane, encoder),
            _ => unreachable!(),
        }

        if style.reset_context_probabilities {
            state.reset_contexts();
        }
    }
}

fn cleanup_pass_encode(state: &mut CodeBlockState, source: &CodeBlockSource, top_bitplane: u8, plane: u8, encoder: &mut impl BitEncoder) {
    for_each_position(state.width, state.height, |cur_pos| {
        if !state.is_significant(cur_pos) && !state.is_zero_coded(cur_pos) {
            let use_rl = cur_pos.y % 4 == 0
                && (state.height - cur_pos.y) >= 4
                && state.neighborhood_significance_states(cur_pos) == 0
                && state.neighborhood_significance_states(&Position::new(cur_pos.x, cur_pos.y + 1)) == 0
                && state.neighborhood_significance_states(&Position::new(cur_pos.x, cur_pos.y + 2)) == 0
                && state.neighborhood_significance_states(&Position::new(cur_pos.x, cur_pos.y + 3)) == 0;

            let bit = if use_rl {
                let column_bits = [
                    source.bit_at(cur_pos, top_bitplane, plane),
                    source.bit_at(&Position::new(cur_pos.x, cur_pos.y + 1), top_bitplane, plane),
                    source.bit_at(&Position::new(cur_pos.x, cur_pos.y + 2), top_bitplane, plane),
                    source.bit_at(&Position::new(cur_pos.x, cur_pos.y + 3), top_bitplane, plane),
                ];

                if column_bits == [0, 0, 0, 0] {
                    encoder.write_bit(0, state.mq_context(17));
                    state.push_magnitude_bit(cur_pos, 0);
                    for _ in 0..3 {
                        cur_pos.y += 1;
                        state.push_magnitude_bit(cur_pos, 0);
                    }
                    return;
                } else {
                    encoder.write_bit(1, state.mq_context(17));
                    let num_zeroes = column_bits.iter().take_while(|&&b| b == 0).count() as u32;

                    encoder.write_bit((num_zeroes >> 1) & 1, state.mq_context(18));
                    encoder.write_bit(num_zeroes & 1, state.mq_context(18));

                    for _ in 0..num_zeroes {
                        state.push_magnitude_bit(cur_pos, 0);
                        cur_pos.y += 1;
                    }

                    1
                }
            } else {
                let bit = source.bit_at(cur_pos, top_bitplane, plane);
                let ctx_label = context_label_zero_coding(cur_pos, state);
                encoder.write_bit(bit, state.mq_context(ctx_label));
                bit
            };

            state.push_magnitude_bit(cur_pos, bit);

            if bit == 1 {
                encode_sign_bit(cur_pos, source, state, encoder);
                state.set_significant(cur_pos);
            }
        }
    });
}

fn significance_propagation_pass_encode(state: &mut CodeBlockState, source: &CodeBlockSource, top_bitplane: u8, plane: u8, encoder: &mut impl BitEncoder) {
    for_each_position(state.width, state.height, |cur_pos| {
        if !state.is_significant(cur_pos) && state.neighborhood_significance_states(cur_pos) != 0 {
            let bit = source.bit_at(cur_pos, top_bitplane, plane);
            let ctx_label = context_label_zero_coding(cur_pos, state);
            encoder.write_bit(bit, state.mq_context(ctx_label));
            state.push_magnitude_bit(cur_pos, bit);
            state.set_zero_coded(cur_pos);

            if bit == 1 {
                encode_sign_bit(cur_pos, source, state, encoder);
                state.set_significant(cur_pos);
            }
        }
    });
}

fn magnitude_refinement_pass_encode(state: &mut CodeBlockState, source: &CodeBlockSource, top_bitplane: u8, plane: u8, encoder: &mut impl BitEncoder) {
    for_each_position(state.width, state.height, |cur_pos| {
        if state.is_significant(cur_pos) && !state.is_zero_coded(cur_pos) {
            let bit = source.bit_at(cur_pos, top_bitplane, plane);
            let ctx_label = context_label_magnitude_refinement_coding(cur_pos, state);
            encoder.write_bit(bit, state.mq_context(ctx_label));
            state.push_magnitude_bit(cur_pos, bit);
            state.set_magnitude_refined(cur_pos);
        }
    });
}

#[inline(always)]
fn encode_sign_bit<T: BitEncoder>(pos: &Position, source: &CodeBlockSource, state: &mut CodeBlockState, encoder: &mut T) {
    let (ctx_label, xor_bit) = context_label_sign_coding(pos, state);
    let actual_sign = source.sign(pos) as u32;
    let written = if T::IS_BYPASS { actual_sign } else { actual_sign ^ xor_bit as u32 };
    encoder.write_bit(written, state.mq_context(ctx_label));
    state.set_sign(pos, actual_sign as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{CodeBlock, CodeBlockStyle, Layer, Segment, SubBandType};
    use crate::rect::IntRect;

    // First packet from the J.10.4 worked example.
    #[test]
    fn bitplane_decoding_j_10_4_first_packet() {
        let data = [0x01, 0x8f, 0x0d, 0xc8, 0x75, 0x5d];

        let code_block = CodeBlock {
            rect: IntRect::from_xywh(0, 0, 1, 5),
            x_idx: 0,
            y_idx: 0,
            layers: 0..1,
            has_been_included: false,
            missing_bit_planes: 0,
            number_of_coding_passes: 16,
            l_block: 0,
            non_empty_layer_count: 1,
        };

        let mut bp_buffers = BitPlaneDecodeBuffers::default();

        let result = decode(
            &code_block,
            SubBandType::LowLow,
            6,
            &CodeBlockStyle::default(),
            &mut bp_buffers,
            &[Layer { segments: Some(0..1) }],
            &[Segment { idx: 0, coding_passes: 16, data_length: data.len() as u32, data: &data }],
        )
        .unwrap();

        let coefficients: Vec<i32> = result.coefficients().collect();
        assert_eq!(coefficients, vec![-26, -22, -30, -32, -19]);
    }

    #[test]
    fn bitplane_decoding_j_10_4_second_packet() {
        let data = [0x0F, 0xB1, 0x76];

        let code_block = CodeBlock {
            rect: IntRect::from_xywh(0, 0, 1, 4),
            x_idx: 0,
            y_idx: 0,
            layers: 0..1,
            has_been_included: false,
            missing_bit_planes: 0,
            number_of_coding_passes: 7,
            l_block: 0,
            non_empty_layer_count: 1,
        };

        let mut bp_buffers = BitPlaneDecodeBuffers::default();

        let result = decode(
            &code_block,
            SubBandType::LowHigh,
            3,
            &CodeBlockStyle::default(),
            &mut bp_buffers,
            &[Layer { segments: Some(0..1) }],
            &[Segment { idx: 0, coding_passes: 7, data_length: data.len() as u32, data: &data }],
        )
        .unwrap();

        let coefficients: Vec<i32> = result.coefficients().collect();
        assert_eq!(coefficients, vec![1, 5, 1, 0]);
    }

    fn round_trip_with_style(values: &[i32], width: u32, height: u32, style: CodeBlockStyle) {
        let source = CodeBlockSource { values, width, height };
        let encoded = encode(&source, SubBandType::HighLow, 10, &style);

        let code_block = CodeBlock {
            rect: IntRect::from_xywh(0, 0, width, height),
            x_idx: 0,
            y_idx: 0,
            layers: 0..1,
            has_been_included: false,
            missing_bit_planes: encoded.missing_bit_planes,
            number_of_coding_passes: encoded.number_of_coding_passes,
            l_block: 0,
            non_empty_layer_count: 1,
        };

        let mut data = Vec::new();
        let mut segments = Vec::new();
        for (idx, (segment_data, passes)) in encoded.segments.iter().zip(encoded.coding_passes_per_segment.iter()).enumerate() {
            let start = data.len();
            data.extend_from_slice(segment_data);
            segments.push((idx as u32, start, data.len(), *passes));
        }

        let segments: Vec<Segment> = segments
            .iter()
            .map(|(idx, start, end, passes)| Segment { idx: *idx, coding_passes: *passes, data_length: (*end - *start) as u32, data: &data[*start..*end] })
            .collect();

        let mut bp_buffers = BitPlaneDecodeBuffers::default();
        let result = decode(
            &code_block,
            SubBandType::HighLow,
            10,
            &style,
            &mut bp_buffers,
            &[Layer { segments: Some(0..segments.len()) }],
            &segments,
        )
        .unwrap();

        let decoded: Vec<i32> = result.coefficients().collect();
        assert_eq!(decoded, values);
    }

    #[test]
    fn encode_decode_round_trip_normal_mode() {
        let values = [3, -7, 0, 12, -1, 0, 5, -5, 2, -2, 0, 0, 9, -15, 4, -3];
        round_trip_with_style(&values, 4, 4, CodeBlockStyle::default());
    }

    #[test]
    fn encode_decode_round_trip_empty_block() {
        round_trip_with_style(&[0; 16], 4, 4, CodeBlockStyle::default());
    }

    #[test]
    fn encode_decode_round_trip_termination_on_each_pass() {
        let values = [3, -7, 0, 12, -1, 0, 5, -5, 2, -2, 0, 0, 9, -15, 4, -3];
        let style = CodeBlockStyle { termination_on_each_pass: true, ..CodeBlockStyle::default() };
        round_trip_with_style(&values, 4, 4, style);
    }

    #[test]
    fn encode_decode_round_trip_selective_bypass() {
        let values = [3, -7, 0, 12, -1, 0, 5, -5, 2, -2, 0, 0, 9, -15, 4, -3, 6, -8, 1, 0];
        let style = CodeBlockStyle { selective_arithmetic_coding_bypass: true, ..CodeBlockStyle::default() };
        round_trip_with_style(&values, 4, 5, style);
    }

    /// A 64x64 code block at the largest allowed stripe-scan width, densely
    /// filled (no runs of zero to let the significance-propagation pass
    /// short-circuit), regression-testing a MQ coder bug class seen at this
    /// exact block size: a position-underflow on `fillC` that misbehaves
    /// only once probability estimation has cycled through enough contexts.
    #[test]
    fn encode_decode_round_trip_64x64_dense() {
        let width: u32 = 64;
        let height: u32 = 64;
        let mut values = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                let v = ((x as i64 * 1_103_515_245 + y as i64 * 12_345 + 7) % 2001) - 1000;
                values.push(v as i32);
            }
        }
        round_trip_with_style(&values, width, height, CodeBlockStyle::default());
    }
}
