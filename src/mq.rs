//! The MQ binary arithmetic coder, described in Annex C.
//!
//! The decoder below follows the "software conventions" variant from
//! Annex G of ITU-T T.88, register-for-register. The encoder is the
//! mirror-image procedure (ENCODE/CODE-MPS/CODE-LPS/BYTEOUT/FLUSH) built to
//! the same register alignment so that bytes written by [`Encoder`] decode
//! correctly through [`Decoder`].

/// State shared by every context label: a probability-estimate state-table
/// index and the current "more probable symbol" value.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct MqContext {
    pub(crate) index: u32,
    pub(crate) mps: u32,
}

impl MqContext {
    pub(crate) fn new(index: u32, mps: u32) -> Self {
        Self { index, mps }
    }
}

#[derive(Debug, Clone, Copy)]
struct QeData {
    qe: u32,
    nmps: u32,
    nlps: u32,
    switch: bool,
}

macro_rules! qe {
    ($($qe:expr, $nmps:expr, $nlps:expr, $switch:expr),+ $(,)?) => {
        [
            $(
                QeData { qe: $qe, nmps: $nmps, nlps: $nlps, switch: $switch }
            ),+
        ]
    };
}

/// QE values and associated state transitions, Table C.2.
#[rustfmt::skip]
static QE_TABLE: [QeData; 47] = qe!(
    0x5601, 1, 1, true,
    0x3401, 2, 6, false,
    0x1801, 3, 9, false,
    0x0AC1, 4, 12, false,
    0x0521, 5, 29, false,
    0x0221, 38, 33, false,
    0x5601, 7, 6, true,
    0x5401, 8, 14, false,
    0x4801, 9, 14, false,
    0x3801, 10, 14, false,
    0x3001, 11, 17, false,
    0x2401, 12, 18, false,
    0x1C01, 13, 20, false,
    0x1601, 29, 21, false,
    0x5601, 15, 14, true,
    0x5401, 16, 14, false,
    0x5101, 17, 15, false,
    0x4801, 18, 16, false,
    0x3801, 19, 17, false,
    0x3401, 20, 18, false,
    0x3001, 21, 19, false,
    0x2801, 22, 19, false,
    0x2401, 23, 20, false,
    0x2201, 24, 21, false,
    0x1C01, 25, 22, false,
    0x1801, 26, 23, false,
    0x1601, 27, 24, false,
    0x1401, 28, 25, false,
    0x1201, 29, 26, false,
    0x1101, 30, 27, false,
    0x0AC1, 31, 28, false,
    0x09C1, 32, 29, false,
    0x08A1, 33, 30, false,
    0x0521, 34, 31, false,
    0x0441, 35, 32, false,
    0x02A1, 36, 33, false,
    0x0221, 37, 34, false,
    0x0141, 38, 35, false,
    0x0111, 39, 36, false,
    0x0085, 40, 37, false,
    0x0049, 41, 38, false,
    0x0025, 42, 39, false,
    0x0015, 43, 40, false,
    0x0009, 44, 41, false,
    0x0005, 45, 42, false,
    0x0001, 46, 43, false,
    0x5601, 46, 46, false,
);

/// Context index 0 (first zero-coding context) starts at state 4, the
/// run-length context (17) starts at state 3, and the uniform context (18)
/// is fixed at state 46 -- Table D.7.
pub(crate) fn initial_context(label: u8) -> MqContext {
    match label {
        0 => MqContext::new(4, 0),
        17 => MqContext::new(3, 0),
        18 => MqContext::new(46, 0),
        _ => MqContext::new(0, 0),
    }
}

pub(crate) struct Decoder<'a> {
    data: &'a [u8],
    c: u32,
    a: u32,
    bp: u32,
    ct: u32,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        let mut decoder = Decoder { data, c: 0, a: 0, bp: 0, ct: 0 };

        // INITDEC, C.3.5 (Annex G variant).
        decoder.c = (decoder.b() as u32 ^ 0xff) << 16;
        decoder.byte_in();
        decoder.c <<= 7;
        decoder.ct = decoder.ct.wrapping_sub(7);
        decoder.a = 0x8000;

        decoder
    }

    pub(crate) fn read_bit(&mut self, context: &mut MqContext) -> u32 {
        self.decode(context)
    }

    /// BYTEIN, C.3.4 (Annex G variant).
    fn byte_in(&mut self) {
        if self.b() == 0xff {
            let b1 = self.b1();
            if b1 > 0x8f {
                self.ct = 8;
            } else {
                self.bp += 1;
                self.c = self.c + 0xfe00 - ((self.b() as u32) << 9);
                self.ct = 7;
            }
        } else {
            self.bp += 1;
            self.c = self.c + 0xff00 - ((self.b() as u32) << 8);
            self.ct = 8;
        }
    }

    /// RENORMD, C.3.3.
    fn renorm_d(&mut self) {
        loop {
            if self.ct == 0 {
                self.byte_in();
            }
            self.a <<= 1;
            self.c <<= 1;
            self.ct -= 1;
            if self.a & 0x8000 != 0 {
                break;
            }
        }
    }

    /// LPS_EXCHANGE, C.3.2.
    fn lps_exchange(&mut self, context: &mut MqContext) -> u32 {
        let qe_entry = &QE_TABLE[context.index as usize];
        let d;

        if self.a < qe_entry.qe {
            self.a = qe_entry.qe;
            d = context.mps;
            context.index = qe_entry.nmps;
        } else {
            self.a = qe_entry.qe;
            d = 1 - context.mps;
            if qe_entry.switch {
                context.mps = 1 - context.mps;
            }
            context.index = qe_entry.nlps;
        }

        d
    }

    /// DECODE, C.3.2 (Annex G variant).
    fn decode(&mut self, context: &mut MqContext) -> u32 {
        let qe_entry = &QE_TABLE[context.index as usize];
        self.a -= qe_entry.qe;

        let d;
        if (self.c >> 16) < self.a {
            if self.a & 0x8000 == 0 {
                d = self.mps_exchange(context);
                self.renorm_d();
            } else {
                d = context.mps;
            }
        } else {
            let c_low = self.c & 0xffff;
            let c_high = (self.c >> 16) - self.a;
            self.c = (c_high << 16) | c_low;
            d = self.lps_exchange(context);
            self.renorm_d();
        }

        d
    }

    /// MPS_EXCHANGE, C.3.2.
    fn mps_exchange(&mut self, context: &mut MqContext) -> u32 {
        let qe_entry = &QE_TABLE[context.index as usize];
        let d;

        if self.a < qe_entry.qe {
            d = 1 - context.mps;
            if qe_entry.switch {
                context.mps = 1 - context.mps;
            }
            context.index = qe_entry.nlps;
        } else {
            d = context.mps;
            context.index = qe_entry.nmps;
        }

        d
    }

    fn b(&self) -> u8 {
        self.data.get(self.bp as usize).copied().unwrap_or(0xff)
    }

    fn b1(&self) -> u8 {
        self.data.get((self.bp + 1) as usize).copied().unwrap_or(0xff)
    }
}

/// Arithmetic encoder, the mirror of [`Decoder`] (ENCODE/CODE-MPS/CODE-LPS
/// from C.2, BYTEOUT/FLUSH using the same register alignment as the
/// decoder's Annex G `DECODE`).
pub(crate) struct Encoder {
    a: u32,
    c: u32,
    ct: i32,
    buf: Vec<u8>,
}

impl Encoder {
    pub(crate) fn new() -> Self {
        Self { a: 0x8000, c: 0, ct: 12, buf: Vec::new() }
    }

    /// ENCODE, C.2.
    pub(crate) fn write_bit(&mut self, bit: u32, context: &mut MqContext) {
        if bit == context.mps {
            self.code_mps(context);
        } else {
            self.code_lps(context);
        }
    }

    fn code_mps(&mut self, context: &mut MqContext) {
        let qe_entry = &QE_TABLE[context.index as usize];
        let qe = qe_entry.qe;
        self.a -= qe;

        if self.a & 0x8000 == 0 {
            if self.a < qe {
                self.a = qe;
            } else {
                self.c += qe;
            }
            context.index = qe_entry.nmps;
            self.renorm_e();
        } else {
            self.c += qe;
        }
    }

    fn code_lps(&mut self, context: &mut MqContext) {
        let qe_entry = &QE_TABLE[context.index as usize];
        let qe = qe_entry.qe;
        self.a -= qe;

        if self.a < qe {
            self.c += qe;
        } else {
            self.a = qe;
        }

        if qe_entry.switch {
            context.mps = 1 - context.mps;
        }
        context.index = qe_entry.nlps;
        self.renorm_e();
    }

    /// RENORME, C.2.1.
    fn renorm_e(&mut self) {
        loop {
            if self.ct == 0 {
                self.byte_out();
            }
            self.a <<= 1;
            self.c <<= 1;
            self.ct -= 1;
            if self.a & 0x8000 != 0 {
                break;
            }
        }
    }

    /// BYTEOUT, C.2.3.
    fn byte_out(&mut self) {
        let last_is_ff = self.buf.last() == Some(&0xff);

        if last_is_ff {
            if self.c > 0x7fff_ffff {
                self.buf.push((self.c >> 20) as u8);
                self.c &= 0xfffff;
                self.ct = 7;
            } else {
                self.buf.push((self.c >> 19) as u8);
                self.c &= 0x7ffff;
                self.ct = 8;
            }
        } else if self.c > 0xfff_ffff {
            if let Some(last) = self.buf.last_mut() {
                *last = last.wrapping_add(1);
            }
            if self.buf.last() == Some(&0xff) {
                self.c &= 0x7fff_ffff;
                self.buf.push((self.c >> 20) as u8);
                self.c &= 0xfffff;
                self.ct = 7;
            } else {
                self.buf.push((self.c >> 19) as u8);
                self.c &= 0x7ffff;
                self.ct = 8;
            }
        } else {
            self.buf.push((self.c >> 19) as u8);
            self.c &= 0x7ffff;
            self.ct = 8;
        }
    }

    /// SETBITS, used by FLUSH (C.2.4) to round C up so the final codeword
    /// is unambiguous under truncation.
    fn set_bits(&mut self) {
        let tempc = self.c.wrapping_add(self.a);
        self.c |= 0xffff;
        if self.c >= tempc {
            self.c = self.c.wrapping_sub(0x8000);
        }
    }

    /// The number of bytes committed so far, without flushing. Monotonic in
    /// the number of bits written: a later call never sees fewer bytes than
    /// an earlier one, since `byte_out` only ever appends or bumps the last
    /// byte already pushed. Used by the rate-control pass to find, for a
    /// normal-mode code-block, how many bytes a truncation after a given
    /// coding pass would cost without re-encoding anything.
    pub(crate) fn byte_len(&self) -> usize {
        self.buf.len()
    }

    /// FLUSH, C.2.4. Consumes the encoder and returns the terminated byte
    /// stream.
    pub(crate) fn finish(mut self) -> Vec<u8> {
        self.set_bits();
        self.c <<= self.ct;
        self.byte_out();
        self.c <<= self.ct;
        self.byte_out();
        self.buf
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// ITU-T T.88 Annex H.2 test sequence for the arithmetic decoder.
    #[test]
    fn decode_conformance_vector() {
        let input = [
            0x84, 0xC7, 0x3B, 0xFC, 0xE1, 0xA1, 0x43, 0x04, 0x02, 0x20, 0x00, 0x00, 0x41, 0x0D,
            0xBB, 0x86, 0xF4, 0x31, 0x7F, 0xFF, 0x88, 0xFF, 0x37, 0x47, 0x1A, 0xDB, 0x6A, 0xDF,
            0xFF, 0xAC,
        ];

        let expected_output = [
            0x00, 0x02, 0x00, 0x51, 0x00, 0x00, 0x00, 0xC0, 0x03, 0x52, 0x87, 0x2A, 0xAA, 0xAA,
            0xAA, 0xAA, 0x82, 0xC0, 0x20, 0x00, 0xFC, 0xD7, 0x9E, 0xF6, 0xBF, 0x7F, 0xED, 0x90,
            0x4F, 0x46, 0xA3, 0xBF,
        ];

        let mut decoder = Decoder::new(&input[..]);
        let mut ctx = MqContext::default();

        let mut bits = Vec::with_capacity(expected_output.len() * 8);
        for _ in 0..expected_output.len() * 8 {
            bits.push(decoder.read_bit(&mut ctx) as u8);
        }

        let mut packed = vec![0u8; expected_output.len()];
        for (i, bit) in bits.iter().enumerate() {
            packed[i / 8] |= bit << (7 - (i % 8));
        }

        assert_eq!(packed, expected_output);
    }

    /// A freshly constructed encoder/decoder pair round-trips an arbitrary
    /// bit sequence coded against a single adaptive context.
    #[test]
    fn encode_decode_round_trip() {
        let bits: Vec<u32> = (0..500).map(|i| ((i * 7 + i / 3) % 5 == 0) as u32).collect();

        let mut encoder = Encoder::new();
        let mut enc_ctx = MqContext::default();
        for &bit in &bits {
            encoder.write_bit(bit, &mut enc_ctx);
        }
        let encoded = encoder.finish();

        let mut decoder = Decoder::new(&encoded);
        let mut dec_ctx = MqContext::default();
        let decoded: Vec<u32> = (0..bits.len()).map(|_| decoder.read_bit(&mut dec_ctx)).collect();

        assert_eq!(decoded, bits);
    }
}
