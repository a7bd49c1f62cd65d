//! The discrete wavelet transform, Annex F: inverse (synthesis, adapted
//! near-verbatim from the teacher's decoder) and forward (analysis, written
//! as its mathematical mirror since the teacher never encodes).
//!
//! The reversible 5/3 transform runs its lifting steps over an integer
//! accumulator ([`i32`] or [`i64`], picked by [`Accumulator::for_image`] from
//! the component's bit depth and decomposition depth) so that lossless round
//! trips stay exact past the point where `f32`'s 24-bit mantissa would start
//! rounding; the irreversible 9/7 transform always runs over `f32`, matching
//! the teacher.

use crate::image::WaveletTransform;
use crate::rect::IntRect;

/// Which integer width the reversible 5/3 lifting should accumulate in.
/// Wider than strictly necessary for low bit depths/shallow decompositions
/// is harmless; the concern is the other direction, where a sum of several
/// lifting stages over a 16-bit-plus source can overflow `i32`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Accumulator {
    Narrow,
    Wide,
}

impl Accumulator {
    pub(crate) fn for_image(bit_depth: u8, levels: u8) -> Accumulator {
        if bit_depth > 16 || levels > 5 {
            Accumulator::Wide
        } else {
            Accumulator::Narrow
        }
    }
}

#[derive(Default, Copy, Clone)]
pub(crate) struct Padding {
    pub(crate) left: usize,
    pub(crate) top: usize,
    pub(crate) right: usize,
    pub(crate) bottom: usize,
}

impl Padding {
    fn new(left: usize, top: usize, right: usize, bottom: usize) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }
}

fn left_extension(transform: WaveletTransform, start: usize) -> usize {
    match transform {
        WaveletTransform::Reversible53 => {
            if start.is_multiple_of(2) {
                1
            } else {
                2
            }
        }
        WaveletTransform::Irreversible97 => {
            if start.is_multiple_of(2) {
                3
            } else {
                4
            }
        }
    }
}

fn right_extension(transform: WaveletTransform, end: usize) -> usize {
    match transform {
        WaveletTransform::Reversible53 => {
            if end.is_multiple_of(2) {
                2
            } else {
                1
            }
        }
        WaveletTransform::Irreversible97 => {
            if end.is_multiple_of(2) {
                4
            } else {
                3
            }
        }
    }
}

/// Equation (F-4).
fn periodic_symmetric_extension(idx: usize, start: usize, end: usize) -> usize {
    let span = 2 * (end as i32 - start as i32 - 1);
    let offset = (idx as i32 - start as i32).rem_euclid(span);
    (start as i32 + offset.min(span - offset)) as usize
}

/// Whole-point symmetric extension past `start`/`end`, Equation (F-4). Pure
/// data movement, so one generic definition serves the `f32` (9/7) and
/// integer (5/3) accumulators alike.
fn extend_signal<T: Copy>(scanline: &mut [T], start: usize, end: usize, transform: WaveletTransform) {
    let i_left = left_extension(transform, start);
    let i_right = right_extension(transform, end);

    for i in (start - i_left)..start {
        scanline[i] = scanline[periodic_symmetric_extension(i, start, end)];
    }
    for i in end..(end + i_right) {
        scanline[i] = scanline[periodic_symmetric_extension(i, start, end)];
    }
}

/// The integer arithmetic the 5/3 reversible lifting steps need: exact
/// addition/subtraction and the two floor-divisions Equations (F-5)/(F-6)
/// use. Implemented for `i32` and `i64` so the lifting code itself doesn't
/// care which accumulator [`Accumulator::for_image`] picked.
trait Lifting: Copy + Default + std::ops::Add<Output = Self> + std::ops::Sub<Output = Self> {
    fn from_small(v: i32) -> Self;
    fn half_floor(sum: Self) -> Self;
    fn quarter_floor(sum_plus_two: Self) -> Self;
    fn from_f32_exact(v: f32) -> Self;
    fn to_f32(self) -> f32;
}

impl Lifting for i32 {
    fn from_small(v: i32) -> Self {
        v
    }
    fn half_floor(sum: Self) -> Self {
        sum.div_euclid(2)
    }
    fn quarter_floor(sum_plus_two: Self) -> Self {
        sum_plus_two.div_euclid(4)
    }
    fn from_f32_exact(v: f32) -> Self {
        v as i32
    }
    fn to_f32(self) -> f32 {
        self as f32
    }
}

impl Lifting for i64 {
    fn from_small(v: i32) -> Self {
        v as i64
    }
    fn half_floor(sum: Self) -> Self {
        sum.div_euclid(2)
    }
    fn quarter_floor(sum_plus_two: Self) -> Self {
        sum_plus_two.div_euclid(4)
    }
    fn from_f32_exact(v: f32) -> Self {
        v as i64
    }
    fn to_f32(self) -> f32 {
        self as f32
    }
}

fn to_exact<T: Lifting>(values: &[f32]) -> Vec<T> {
    values.iter().map(|&v| T::from_f32_exact(v)).collect()
}

fn from_exact<T: Lifting>(values: &[T]) -> Vec<f32> {
    values.iter().map(|&v| v.to_f32()).collect()
}

fn bands_to_exact<T: Lifting>(bands: &[(Vec<f32>, Vec<f32>, Vec<f32>)]) -> Vec<(Vec<T>, Vec<T>, Vec<T>)> {
    bands
        .iter()
        .map(|(hl, lh, hh)| (to_exact(hl), to_exact(lh), to_exact(hh)))
        .collect()
}

fn bands_from_exact<T: Lifting>(bands: Vec<(Vec<T>, Vec<T>, Vec<T>)>) -> Vec<(Vec<f32>, Vec<f32>, Vec<f32>)> {
    bands
        .into_iter()
        .map(|(hl, lh, hh)| (from_exact(&hl), from_exact(&lh), from_exact(&hh)))
        .collect()
}

// --- Reversible 5/3, synthesis (decode). The 1D FILTER 5-3R procedure, F.3.8.1. ---

/// Equation (F-5)/(F-6), undone: the synthesis direction of the 5/3 lifting.
fn reversible_synth_53<T: Lifting>(scanline: &mut [T], start: usize, end: usize) {
    let scanline = &mut scanline[..2 * (end / 2 + 1)];
    let two = T::from_small(2);

    // Equation (F-5): undo the update step.
    for n in start / 2..(end / 2) + 1 {
        let base_idx = 2 * n;
        scanline[base_idx] = scanline[base_idx] - T::quarter_floor(scanline[base_idx - 1] + scanline[base_idx + 1] + two);
    }

    // Equation (F-6): undo the predict step.
    for n in start / 2..(end / 2) {
        let base_idx = 2 * n + 1;
        scanline[base_idx] = scanline[base_idx] + T::half_floor(scanline[base_idx - 1] + scanline[base_idx + 1]);
    }
}

/// The forward mirror of `reversible_synth_53`: predict then update, the
/// exact inverse sequence (so `reversible_synth_53(reversible_analysis_53(x))
/// == x`).
fn reversible_analysis_53<T: Lifting>(scanline: &mut [T], start: usize, end: usize) {
    let scanline = &mut scanline[..2 * (end / 2 + 1)];
    let two = T::from_small(2);

    for n in start / 2..(end / 2) {
        let base_idx = 2 * n + 1;
        scanline[base_idx] = scanline[base_idx] - T::half_floor(scanline[base_idx - 1] + scanline[base_idx + 1]);
    }

    for n in start / 2..(end / 2) + 1 {
        let base_idx = 2 * n;
        scanline[base_idx] = scanline[base_idx] + T::quarter_floor(scanline[base_idx - 1] + scanline[base_idx + 1] + two);
    }
}

/// The 1D_SR / 1D analysis procedure, F.3.6, for the 5/3 filter. `synth`
/// selects the decode direction; set `false` for the encode (analysis)
/// direction. Unlike the 9/7 path below, 5/3 has no half-sample scaling at a
/// length-1 boundary.
fn filter_single_row_reversible<T: Lifting>(scanline: &mut [T], start: usize, end: usize, synth: bool) {
    if start == end - 1 {
        return;
    }

    extend_signal(scanline, start, end, WaveletTransform::Reversible53);

    if synth {
        reversible_synth_53(scanline, start, end);
    } else {
        reversible_analysis_53(scanline, start, end);
    }
}

// --- Irreversible 9/7, always over f32. The 1D Filter 9-7I procedure, F.3.8.2. ---

const ALPHA: f32 = -1.586_134_3;
const BETA: f32 = -0.052_980_117;
const GAMMA: f32 = 0.882_911_1;
const DELTA: f32 = 0.443_506_87;
const KAPPA: f32 = 1.230_174_1;

fn irreversible_synth_97(scanline: &mut [f32], start: usize, end: usize) {
    let scanline = &mut scanline[..2 * (end / 2 + 2)];

    for i in (start / 2 - 1)..(end / 2 + 2) {
        scanline[2 * i] *= KAPPA;
    }
    for i in (start / 2 - 2)..(end / 2 + 2) {
        scanline[2 * i + 1] *= 1.0 / KAPPA;
    }
    for i in (start / 2 - 1)..(end / 2 + 2) {
        scanline[2 * i] -= DELTA * (scanline[2 * i - 1] + scanline[2 * i + 1]);
    }
    for i in (start / 2 - 1)..(end / 2 + 1) {
        scanline[2 * i + 1] -= GAMMA * (scanline[2 * i] + scanline[2 * i + 2]);
    }
    for i in (start / 2)..(end / 2 + 1) {
        scanline[2 * i] -= BETA * (scanline[2 * i - 1] + scanline[2 * i + 1]);
    }
    for i in (start / 2)..(end / 2) {
        scanline[2 * i + 1] -= ALPHA * (scanline[2 * i] + scanline[2 * i + 2]);
    }
}

/// The forward mirror: undoes `irreversible_synth_97`'s six steps in
/// reverse order with the opposite operation.
fn irreversible_analysis_97(scanline: &mut [f32], start: usize, end: usize) {
    let scanline = &mut scanline[..2 * (end / 2 + 2)];

    for i in (start / 2)..(end / 2) {
        scanline[2 * i + 1] += ALPHA * (scanline[2 * i] + scanline[2 * i + 2]);
    }
    for i in (start / 2)..(end / 2 + 1) {
        scanline[2 * i] += BETA * (scanline[2 * i - 1] + scanline[2 * i + 1]);
    }
    for i in (start / 2 - 1)..(end / 2 + 1) {
        scanline[2 * i + 1] += GAMMA * (scanline[2 * i] + scanline[2 * i + 2]);
    }
    for i in (start / 2 - 1)..(end / 2 + 2) {
        scanline[2 * i] += DELTA * (scanline[2 * i - 1] + scanline[2 * i + 1]);
    }
    for i in (start / 2 - 2)..(end / 2 + 2) {
        scanline[2 * i + 1] *= KAPPA;
    }
    for i in (start / 2 - 1)..(end / 2 + 2) {
        scanline[2 * i] *= 1.0 / KAPPA;
    }
}

/// The 1D_SR / 1D analysis procedure, F.3.6, for the 9/7 filter, which is
/// always `f32` (see the module doc for why 5/3 instead runs over an
/// integer accumulator).
fn filter_single_row_irreversible_f32(scanline: &mut [f32], start: usize, end: usize, synth: bool) {
    if start == end - 1 {
        if synth {
            if !start.is_multiple_of(2) {
                scanline[start] /= 2.0;
            }
        } else if !start.is_multiple_of(2) {
            scanline[start] *= 2.0;
        }
        return;
    }

    extend_signal(scanline, start, end, WaveletTransform::Irreversible97);

    if synth {
        irreversible_synth_97(scanline, start, end);
    } else {
        irreversible_analysis_97(scanline, start, end);
    }
}

/// Coefficients for one in-progress resolution level buffer. Generic over
/// the accumulator: `f32` for the irreversible 9/7 driver, `i32`/`i64` for
/// the reversible 5/3 driver (see [`Accumulator`]).
pub(crate) struct LevelBuffer<T> {
    pub(crate) coefficients: Vec<T>,
    padding: Padding,
    pub(crate) rect: IntRect,
}

/// The padding a level's rect needs on each side before 1D filtering can run
/// across its boundary samples, Equation (F-4)'s extension widths plus the
/// one extra sample `interleave`/`deinterleave` reserve for the coarser
/// sub-band's odd/even parity.
fn band_padding(transform: WaveletTransform, rect: IntRect) -> Padding {
    Padding::new(
        left_extension(transform, rect.x0 as usize) + 1,
        left_extension(transform, rect.y0 as usize) + 1,
        right_extension(transform, rect.x1 as usize),
        right_extension(transform, rect.y1 as usize),
    )
}

/// A single sub-band's coefficients together with its kind, used as input to
/// the 2D interleave/deinterleave step.
struct BandInput<'a, T> {
    coefficients: &'a [T],
    padding: Padding,
    kind: crate::image::SubBandType,
}

impl<'a, T: Copy> BandInput<'a, T> {
    fn leaf(coefficients: &'a [T], kind: crate::image::SubBandType) -> Self {
        BandInput {
            coefficients,
            padding: Padding::default(),
            kind,
        }
    }

    fn from_level(level: &'a LevelBuffer<T>) -> Self {
        BandInput {
            coefficients: &level.coefficients,
            padding: level.padding,
            kind: crate::image::SubBandType::LowLow,
        }
    }
}

/// One decomposition level's geometry, as already computed from the marker
/// header (matches `image::Decomposition::rect` plus the three band rects).
pub(crate) struct LevelGeometry {
    pub(crate) rect: IntRect,
    pub(crate) hl_rect: IntRect,
    pub(crate) lh_rect: IntRect,
    pub(crate) hh_rect: IntRect,
}

/// Inverse (synthesis) multi-resolution reconstruction, dispatching to the
/// accumulator `transform`/`bit_depth` call for. `bit_depth` is the
/// component's nominal precision (`ComponentSizeInfo::precision`); only
/// consulted for the reversible filter, per [`Accumulator::for_image`].
pub(crate) fn inverse_apply(
    ll: &[f32],
    ll_rect: IntRect,
    levels: &[LevelGeometry],
    bands: &[(Vec<f32>, Vec<f32>, Vec<f32>)],
    transform: WaveletTransform,
    bit_depth: u8,
) -> LevelBuffer<f32> {
    match transform {
        WaveletTransform::Irreversible97 => inverse_apply_irreversible_f32(ll, ll_rect, levels, bands),
        WaveletTransform::Reversible53 => match Accumulator::for_image(bit_depth, levels.len() as u8) {
            Accumulator::Narrow => widen_back(inverse_apply_reversible::<i32>(
                &to_exact(ll),
                ll_rect,
                levels,
                &bands_to_exact(bands),
            )),
            Accumulator::Wide => widen_back(inverse_apply_reversible::<i64>(
                &to_exact(ll),
                ll_rect,
                levels,
                &bands_to_exact(bands),
            )),
        },
    }
}

fn widen_back<T: Lifting>(buffer: LevelBuffer<T>) -> LevelBuffer<f32> {
    LevelBuffer {
        coefficients: from_exact(&buffer.coefficients),
        padding: buffer.padding,
        rect: buffer.rect,
    }
}

fn inverse_apply_irreversible_f32(
    ll: &[f32],
    ll_rect: IntRect,
    levels: &[LevelGeometry],
    bands: &[(Vec<f32>, Vec<f32>, Vec<f32>)],
) -> LevelBuffer<f32> {
    if levels.is_empty() {
        return LevelBuffer {
            coefficients: ll.to_vec(),
            padding: Padding::default(),
            rect: ll_rect,
        };
    }

    let mut current = filter_2d(
        BandInput::leaf(ll, crate::image::SubBandType::LowLow),
        &levels[0],
        &bands[0],
        WaveletTransform::Irreversible97,
        filter_single_row_irreversible_f32,
    );

    for (level, band) in levels.iter().zip(bands.iter()).skip(1) {
        current = filter_2d(
            BandInput::from_level(&current),
            level,
            band,
            WaveletTransform::Irreversible97,
            filter_single_row_irreversible_f32,
        );
    }

    current
}

fn inverse_apply_reversible<T: Lifting>(
    ll: &[T],
    ll_rect: IntRect,
    levels: &[LevelGeometry],
    bands: &[(Vec<T>, Vec<T>, Vec<T>)],
) -> LevelBuffer<T> {
    if levels.is_empty() {
        return LevelBuffer {
            coefficients: ll.to_vec(),
            padding: Padding::default(),
            rect: ll_rect,
        };
    }

    let mut current = filter_2d(
        BandInput::leaf(ll, crate::image::SubBandType::LowLow),
        &levels[0],
        &bands[0],
        WaveletTransform::Reversible53,
        filter_single_row_reversible::<T>,
    );

    for (level, band) in levels.iter().zip(bands.iter()).skip(1) {
        current = filter_2d(
            BandInput::from_level(&current),
            level,
            band,
            WaveletTransform::Reversible53,
            filter_single_row_reversible::<T>,
        );
    }

    current
}

fn filter_2d<T: Copy + Default>(
    input: BandInput<T>,
    level: &LevelGeometry,
    bands: &(Vec<T>, Vec<T>, Vec<T>),
    transform: WaveletTransform,
    row_filter: impl Fn(&mut [T], usize, usize, bool) + Copy,
) -> LevelBuffer<T> {
    let mut interleaved = interleave(input, level, bands, transform);

    if level.rect.width() > 0 && level.rect.height() > 0 {
        filter_horizontal(&mut interleaved, level.rect, row_filter, true);
        filter_vertical(&mut interleaved, level.rect, row_filter, true);
    }

    LevelBuffer {
        coefficients: interleaved.coefficients,
        padding: interleaved.padding,
        rect: level.rect,
    }
}

struct Interleaved<T> {
    coefficients: Vec<T>,
    padding: Padding,
}

/// The 2D_INTERLEAVE procedure, F.3.3.
fn interleave<T: Copy + Default>(
    input: BandInput<T>,
    level: &LevelGeometry,
    bands: &(Vec<T>, Vec<T>, Vec<T>),
    transform: WaveletTransform,
) -> Interleaved<T> {
    let new_padding = band_padding(transform, level.rect);

    let total_width = level.rect.width() as usize + new_padding.left + new_padding.right;
    let total_height = level.rect.height() as usize + new_padding.top + new_padding.bottom;

    let mut interleaved = Interleaved {
        coefficients: vec![T::default(); total_width * total_height],
        padding: new_padding,
    };

    let IntRect {
        x0: u0,
        x1: u1,
        y0: v0,
        y1: v1,
    } = level.rect;

    let hl = BandInput::leaf(&bands.0, crate::image::SubBandType::HighLow);
    let lh = BandInput::leaf(&bands.1, crate::image::SubBandType::LowHigh);
    let hh = BandInput::leaf(&bands.2, crate::image::SubBandType::HighHigh);

    for band_input in [input, hl, lh, hh] {
        let (u_min, u_max) = match band_input.kind {
            crate::image::SubBandType::LowLow | crate::image::SubBandType::LowHigh => {
                (u0.div_ceil(2), u1.div_ceil(2))
            }
            crate::image::SubBandType::HighLow | crate::image::SubBandType::HighHigh => {
                (u0 / 2, u1 / 2)
            }
        };

        let (v_min, v_max) = match band_input.kind {
            crate::image::SubBandType::LowLow | crate::image::SubBandType::HighLow => {
                (v0.div_ceil(2), v1.div_ceil(2))
            }
            crate::image::SubBandType::LowHigh | crate::image::SubBandType::HighHigh => {
                (v0 / 2, v1 / 2)
            }
        };

        let num_v = v_max - v_min;
        let num_u = u_max - u_min;

        if num_u == 0 || num_v == 0 {
            continue;
        }

        let input_left_padding = band_input.padding.left;
        let input_right_padding = band_input.padding.right;
        let input_total_width = num_u + input_left_padding as u32 + input_right_padding as u32;

        let (start_x, start_y) = match band_input.kind {
            crate::image::SubBandType::LowLow => (2 * u_min, 2 * v_min),
            crate::image::SubBandType::LowHigh => (2 * u_min, 2 * v_min + 1),
            crate::image::SubBandType::HighLow => (2 * u_min + 1, 2 * v_min),
            crate::image::SubBandType::HighHigh => (2 * u_min + 1, 2 * v_min + 1),
        };

        let coefficient_rows = interleaved
            .coefficients
            .chunks_exact_mut(total_width)
            .map(|s| &mut s[new_padding.left..][..level.rect.width() as usize])
            .skip((start_y - v0) as usize + new_padding.top)
            .step_by(2);

        for (v_b, coefficient_row) in coefficient_rows.enumerate().take(num_v as usize) {
            let coefficient_row =
                &mut coefficient_row[(start_x - u0) as usize..][..(num_u - 1) as usize * 2 + 1];

            for u_b in 0..num_u {
                coefficient_row[u_b as usize * 2] = band_input.coefficients[(v_b
                    + band_input.padding.top)
                    * input_total_width as usize
                    + u_b as usize
                    + input_left_padding];
            }
        }
    }

    interleaved
}

/// The HOR_SR procedure, F.3.4 (or its analysis mirror when `synth` is
/// `false`).
fn filter_horizontal<T: Copy>(
    samples: &mut Interleaved<T>,
    rect: IntRect,
    row_filter: impl Fn(&mut [T], usize, usize, bool),
    synth: bool,
) {
    let total_width = rect.width() as usize + samples.padding.left + samples.padding.right;

    for scanline in samples
        .coefficients
        .chunks_exact_mut(total_width)
        .skip(samples.padding.top)
        .take(rect.height() as usize)
    {
        row_filter(
            scanline,
            samples.padding.left,
            samples.padding.left + rect.width() as usize,
            synth,
        );
    }
}

/// The VER_SR procedure, F.3.5 (or its analysis mirror).
fn filter_vertical<T: Copy>(
    samples: &mut Interleaved<T>,
    rect: IntRect,
    row_filter: impl Fn(&mut [T], usize, usize, bool),
    synth: bool,
) {
    let total_width = rect.width() as usize + samples.padding.left + samples.padding.right;
    let total_height = rect.height() as usize + samples.padding.top + samples.padding.bottom;

    let mut temp_buf = Vec::with_capacity(total_height);

    for u in samples.padding.left..(rect.width() as usize + samples.padding.left) {
        temp_buf.clear();
        for y in 0..total_height {
            temp_buf.push(samples.coefficients[u + total_width * y]);
        }

        row_filter(
            &mut temp_buf,
            samples.padding.top,
            samples.padding.top + rect.height() as usize,
            synth,
        );

        for (y, item) in temp_buf.iter().enumerate().take(total_height) {
            samples.coefficients[u + total_width * y] = *item;
        }
    }
}

/// Forward (analysis) multi-resolution decomposition: the encoder's mirror
/// of `inverse_apply`. There's no teacher counterpart (hayro never encodes);
/// this runs the same lifting filters in analysis mode and the F.3.2
/// 2D_DEINTERLEAVE split, composed in the reverse row/column order from
/// `filter_2d` so that `inverse_apply` undoes it exactly: synthesis filters
/// horizontal then vertical, so analysis here undoes vertical then
/// horizontal before splitting into sub-bands.
///
/// `samples` holds `rect`'s full-resolution coefficients. `levels` must be
/// ordered coarsest-first, matching `inverse_apply`'s convention, so this
/// walks it back to front. Returns the final LL band and, for each level in
/// `levels`' original order, its `(hl, lh, hh)` bands. `bit_depth` selects
/// the reversible filter's accumulator width, as in `inverse_apply`.
pub(crate) fn forward_apply(
    samples: &[f32],
    rect: IntRect,
    levels: &[LevelGeometry],
    transform: WaveletTransform,
    bit_depth: u8,
) -> (Vec<f32>, Vec<(Vec<f32>, Vec<f32>, Vec<f32>)>) {
    match transform {
        WaveletTransform::Irreversible97 => forward_apply_irreversible_f32(samples, rect, levels),
        WaveletTransform::Reversible53 => match Accumulator::for_image(bit_depth, levels.len() as u8) {
            Accumulator::Narrow => {
                let (ll, bands) = forward_apply_reversible::<i32>(&to_exact(samples), rect, levels);
                (from_exact(&ll), bands_from_exact(bands))
            }
            Accumulator::Wide => {
                let (ll, bands) = forward_apply_reversible::<i64>(&to_exact(samples), rect, levels);
                (from_exact(&ll), bands_from_exact(bands))
            }
        },
    }
}

fn forward_apply_irreversible_f32(
    samples: &[f32],
    rect: IntRect,
    levels: &[LevelGeometry],
) -> (Vec<f32>, Vec<(Vec<f32>, Vec<f32>, Vec<f32>)>) {
    if levels.is_empty() {
        return (samples.to_vec(), Vec::new());
    }

    let mut current = samples.to_vec();
    let mut current_rect = rect;
    let mut bands = vec![(Vec::new(), Vec::new(), Vec::new()); levels.len()];

    for (idx, level) in levels.iter().enumerate().rev() {
        let (ll, hl, lh, hh) = split_one_level_irreversible_f32(&current, current_rect, level);
        bands[idx] = (hl, lh, hh);
        current = ll;
        current_rect = IntRect::from_ltrb(
            level.rect.x0.div_ceil(2),
            level.rect.y0.div_ceil(2),
            level.rect.x1.div_ceil(2),
            level.rect.y1.div_ceil(2),
        );
    }

    (current, bands)
}

fn forward_apply_reversible<T: Lifting>(
    samples: &[T],
    rect: IntRect,
    levels: &[LevelGeometry],
) -> (Vec<T>, Vec<(Vec<T>, Vec<T>, Vec<T>)>) {
    if levels.is_empty() {
        return (samples.to_vec(), Vec::new());
    }

    let mut current = samples.to_vec();
    let mut current_rect = rect;
    let mut bands = vec![(Vec::new(), Vec::new(), Vec::new()); levels.len()];

    for (idx, level) in levels.iter().enumerate().rev() {
        let (ll, hl, lh, hh) = split_one_level_reversible(&current, current_rect, level);
        bands[idx] = (hl, lh, hh);
        current = ll;
        current_rect = IntRect::from_ltrb(
            level.rect.x0.div_ceil(2),
            level.rect.y0.div_ceil(2),
            level.rect.x1.div_ceil(2),
            level.rect.y1.div_ceil(2),
        );
    }

    (current, bands)
}

fn split_one_level_irreversible_f32(
    samples: &[f32],
    rect: IntRect,
    level: &LevelGeometry,
) -> (Vec<f32>, Vec<f32>, Vec<f32>, Vec<f32>) {
    let padding = band_padding(WaveletTransform::Irreversible97, rect);
    let mut buf = pad_samples(samples, rect, padding);

    if rect.width() > 0 && rect.height() > 0 {
        filter_vertical(&mut buf, rect, filter_single_row_irreversible_f32, false);
        filter_horizontal(&mut buf, rect, filter_single_row_irreversible_f32, false);
    }

    deinterleave(&buf, level)
}

fn split_one_level_reversible<T: Lifting>(
    samples: &[T],
    rect: IntRect,
    level: &LevelGeometry,
) -> (Vec<T>, Vec<T>, Vec<T>, Vec<T>) {
    let padding = band_padding(WaveletTransform::Reversible53, rect);
    let mut buf = pad_samples(samples, rect, padding);

    if rect.width() > 0 && rect.height() > 0 {
        filter_vertical(&mut buf, rect, filter_single_row_reversible::<T>, false);
        filter_horizontal(&mut buf, rect, filter_single_row_reversible::<T>, false);
    }

    deinterleave(&buf, level)
}

fn pad_samples<T: Copy + Default>(samples: &[T], rect: IntRect, padding: Padding) -> Interleaved<T> {
    let total_width = rect.width() as usize + padding.left + padding.right;
    let total_height = rect.height() as usize + padding.top + padding.bottom;
    let mut coefficients = vec![T::default(); total_width * total_height];

    for y in 0..rect.height() as usize {
        let src = &samples[y * rect.width() as usize..][..rect.width() as usize];
        let dst_start = (y + padding.top) * total_width + padding.left;
        coefficients[dst_start..][..rect.width() as usize].copy_from_slice(src);
    }

    Interleaved { coefficients, padding }
}

/// The F.3.2 2D_DEINTERLEAVE procedure: the mirror of `interleave`, reading
/// even/odd sample positions back out into separate LL/HL/LH/HH arrays
/// instead of writing them in.
fn deinterleave<T: Copy + Default>(interleaved: &Interleaved<T>, level: &LevelGeometry) -> (Vec<T>, Vec<T>, Vec<T>, Vec<T>) {
    let new_padding = interleaved.padding;
    let total_width = level.rect.width() as usize + new_padding.left + new_padding.right;

    let IntRect { x0: u0, x1: u1, y0: v0, y1: v1 } = level.rect;

    let mut outputs = [
        (crate::image::SubBandType::LowLow, Vec::new()),
        (crate::image::SubBandType::HighLow, Vec::new()),
        (crate::image::SubBandType::LowHigh, Vec::new()),
        (crate::image::SubBandType::HighHigh, Vec::new()),
    ];

    for (kind, out) in outputs.iter_mut() {
        let (u_min, u_max) = match kind {
            crate::image::SubBandType::LowLow | crate::image::SubBandType::LowHigh => (u0.div_ceil(2), u1.div_ceil(2)),
            crate::image::SubBandType::HighLow | crate::image::SubBandType::HighHigh => (u0 / 2, u1 / 2),
        };
        let (v_min, v_max) = match kind {
            crate::image::SubBandType::LowLow | crate::image::SubBandType::HighLow => (v0.div_ceil(2), v1.div_ceil(2)),
            crate::image::SubBandType::LowHigh | crate::image::SubBandType::HighHigh => (v0 / 2, v1 / 2),
        };

        let num_u = u_max - u_min;
        let num_v = v_max - v_min;
        *out = vec![T::default(); (num_u * num_v) as usize];

        if num_u == 0 || num_v == 0 {
            continue;
        }

        let (start_x, start_y) = match kind {
            crate::image::SubBandType::LowLow => (2 * u_min, 2 * v_min),
            crate::image::SubBandType::LowHigh => (2 * u_min, 2 * v_min + 1),
            crate::image::SubBandType::HighLow => (2 * u_min + 1, 2 * v_min),
            crate::image::SubBandType::HighHigh => (2 * u_min + 1, 2 * v_min + 1),
        };

        let coefficient_rows = interleaved
            .coefficients
            .chunks_exact(total_width)
            .map(|s| &s[new_padding.left..][..level.rect.width() as usize])
            .skip((start_y - v0) as usize + new_padding.top)
            .step_by(2);

        for (v_b, coefficient_row) in coefficient_rows.enumerate().take(num_v as usize) {
            let coefficient_row = &coefficient_row[(start_x - u0) as usize..][..(num_u - 1) as usize * 2 + 1];

            for u_b in 0..num_u {
                out[v_b * num_u as usize + u_b as usize] = coefficient_row[u_b as usize * 2];
            }
        }
    }

    let [(_, ll), (_, hl), (_, lh), (_, hh)] = outputs;
    (ll, hl, lh, hh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pse() {
        assert_eq!(periodic_symmetric_extension(0, 3, 6), 4);
        assert_eq!(periodic_symmetric_extension(3, 3, 6), 3);
        assert_eq!(periodic_symmetric_extension(6, 3, 6), 4);
    }

    #[test]
    fn accumulator_selection_matches_bit_depth_and_levels() {
        assert_eq!(Accumulator::for_image(8, 3), Accumulator::Narrow);
        assert_eq!(Accumulator::for_image(16, 5), Accumulator::Narrow);
        assert_eq!(Accumulator::for_image(17, 1), Accumulator::Wide);
        assert_eq!(Accumulator::for_image(8, 6), Accumulator::Wide);
    }

    #[test]
    fn reversible_53_round_trip_i32() {
        // Extend manually with margin so the in-place filters have room.
        let start = 4;
        let end = 12;
        let mut original = vec![0i32; end + 4];
        for (i, v) in original.iter_mut().enumerate().skip(start).take(end - start) {
            *v = (i as i32 * 7) % 13 - 6;
        }

        let mut buf = original.clone();
        extend_signal(&mut buf, start, end, WaveletTransform::Reversible53);
        reversible_analysis_53::<i32>(&mut buf, start, end);
        extend_signal(&mut buf, start, end, WaveletTransform::Reversible53);
        reversible_synth_53::<i32>(&mut buf, start, end);

        assert_eq!(&buf[start..end], &original[start..end]);
    }

    #[test]
    fn reversible_53_round_trip_i64_large_magnitude() {
        // Values well past f32's 24-bit exact-integer mantissa, to exercise
        // the wide accumulator the narrow f32 driver used to silently skip.
        let start = 4;
        let end = 12;
        let big: i64 = 1 << 30;
        let mut original = vec![0i64; end + 4];
        for (i, v) in original.iter_mut().enumerate().skip(start).take(end - start) {
            *v = big + (i as i64 * 7) % 13 - 6;
        }

        let mut buf = original.clone();
        extend_signal(&mut buf, start, end, WaveletTransform::Reversible53);
        reversible_analysis_53::<i64>(&mut buf, start, end);
        extend_signal(&mut buf, start, end, WaveletTransform::Reversible53);
        reversible_synth_53::<i64>(&mut buf, start, end);

        assert_eq!(&buf[start..end], &original[start..end]);
    }

    #[test]
    fn forward_then_inverse_reconstructs_reversible_narrow_accumulator() {
        let rect = IntRect::from_xywh(0, 0, 8, 8);
        let mut original = vec![0.0f32; 64];
        for (i, v) in original.iter_mut().enumerate() {
            *v = ((i as i32 * 11) % 23 - 11) as f32;
        }

        let level = LevelGeometry {
            rect,
            hl_rect: IntRect::from_xywh(0, 0, 4, 4),
            lh_rect: IntRect::from_xywh(0, 0, 4, 4),
            hh_rect: IntRect::from_xywh(0, 0, 4, 4),
        };

        let (ll, bands) = forward_apply(&original, rect, std::slice::from_ref(&level), WaveletTransform::Reversible53, 8);
        let ll_rect = IntRect::from_xywh(0, 0, 4, 4);

        let reconstructed = inverse_apply(&ll, ll_rect, std::slice::from_ref(&level), &bands, WaveletTransform::Reversible53, 8);

        assert_eq!(reconstructed.coefficients, original);
    }

    #[test]
    fn forward_then_inverse_reconstructs_reversible_wide_accumulator() {
        // bit_depth 20 forces Accumulator::Wide (i64) through the public API.
        let rect = IntRect::from_xywh(0, 0, 8, 8);
        let mut original = vec![0.0f32; 64];
        for (i, v) in original.iter_mut().enumerate() {
            *v = (((i as i64 * 11) % 23 - 11) + (1 << 19)) as f32;
        }

        let level = LevelGeometry {
            rect,
            hl_rect: IntRect::from_xywh(0, 0, 4, 4),
            lh_rect: IntRect::from_xywh(0, 0, 4, 4),
            hh_rect: IntRect::from_xywh(0, 0, 4, 4),
        };

        let (ll, bands) = forward_apply(&original, rect, std::slice::from_ref(&level), WaveletTransform::Reversible53, 20);
        let ll_rect = IntRect::from_xywh(0, 0, 4, 4);

        let reconstructed = inverse_apply(&ll, ll_rect, std::slice::from_ref(&level), &bands, WaveletTransform::Reversible53, 20);

        assert_eq!(reconstructed.coefficients, original);
    }

    #[test]
    fn forward_then_inverse_reconstructs_irreversible_closely() {
        let rect = IntRect::from_xywh(0, 0, 8, 8);
        let mut original = vec![0.0f32; 64];
        for (i, v) in original.iter_mut().enumerate() {
            *v = ((i as i32 * 11) % 23 - 11) as f32;
        }

        let level = LevelGeometry {
            rect,
            hl_rect: IntRect::from_xywh(0, 0, 4, 4),
            lh_rect: IntRect::from_xywh(0, 0, 4, 4),
            hh_rect: IntRect::from_xywh(0, 0, 4, 4),
        };

        let (ll, bands) = forward_apply(&original, rect, std::slice::from_ref(&level), WaveletTransform::Irreversible97, 8);
        let ll_rect = IntRect::from_xywh(0, 0, 4, 4);

        let reconstructed = inverse_apply(&ll, ll_rect, std::slice::from_ref(&level), &bands, WaveletTransform::Irreversible97, 8);

        for (a, b) in reconstructed.coefficients.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-2, "a={a} b={b}");
        }
    }

    #[test]
    fn irreversible_97_round_trip_is_close() {
        let start = 4;
        let end = 12;
        let mut original = vec![0f32; end + 4];
        for (i, v) in original.iter_mut().enumerate().skip(start).take(end - start) {
            *v = ((i as i32 * 7) % 13 - 6) as f32;
        }

        let mut buf = original.clone();
        extend_signal(&mut buf, start, end, WaveletTransform::Irreversible97);
        irreversible_analysis_97(&mut buf, start, end);
        extend_signal(&mut buf, start, end, WaveletTransform::Irreversible97);
        irreversible_synth_97(&mut buf, start, end);

        for (a, b) in buf[start..end].iter().zip(original[start..end].iter()) {
            assert!((a - b).abs() < 1e-2, "a={a} b={b}");
        }
    }
}
