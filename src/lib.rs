//! A JPEG 2000 Part 1 (ISO/IEC 15444-1) codestream codec core: the wavelet
//! transform, scalar quantization, EBCOT Tier-1 and Tier-2 entropy coding,
//! and PCRD-opt rate allocation needed to turn raw component planes into a
//! conformant codestream and back.
//!
//! [`decoder::decode`] parses a codestream into an [`decoder::Image`].
//! [`encoder::encode`] does the reverse: given an [`decoder::Image`] and an
//! [`encoder::EncoderConfig`], it produces a codestream a conformant decoder
//! (this one included) can read back losslessly under the reversible 5/3
//! transform.
//!
//! Multi-component transform choice, progression order and rate control are
//! all encoder-side decisions; decode follows whatever the codestream's
//! marker segments say.

#![forbid(unsafe_code)]

mod bit_reader;
mod bit_writer;
mod byte_reader;
mod codestream;
mod decoder;
mod dwt;
mod encoder;
mod error;
mod image;
mod markers;
mod mct;
mod mq;
mod pcrd;
mod progression;
mod quant;
mod rect;
mod tag_tree;
mod tier1;
mod tier2;

pub use decoder::{decode, DecodeSettings, Image, Plane, TileWarning};
pub use encoder::{encode, EncoderConfig};
pub use error::{J2kError, Result};
pub use image::{ProgressionOrder, WaveletTransform};
