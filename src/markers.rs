//! Marker codes defined by ISO/IEC 15444-1 Annex A.

/// Start of codestream.
pub(crate) const SOC: u8 = 0x4F;
/// Start of tile-part.
pub(crate) const SOT: u8 = 0x90;
/// Start of data.
pub(crate) const SOD: u8 = 0x93;
/// End of codestream.
pub(crate) const EOC: u8 = 0xD9;
/// Image and tile size.
pub(crate) const SIZ: u8 = 0x51;
/// Coding style default.
pub(crate) const COD: u8 = 0x52;
/// Coding style component.
pub(crate) const COC: u8 = 0x53;
/// Region of interest.
pub(crate) const RGN: u8 = 0x5E;
/// Quantization default.
pub(crate) const QCD: u8 = 0x5C;
/// Quantization component.
pub(crate) const QCC: u8 = 0x5D;
/// Progression order change.
pub(crate) const POC: u8 = 0x5F;
/// Tile-part lengths.
pub(crate) const TLM: u8 = 0x55;
/// Packet length, main header.
pub(crate) const PLM: u8 = 0x57;
/// Packet length, tile-part header.
pub(crate) const PLT: u8 = 0x58;
/// Packed packet headers, main header.
pub(crate) const PPM: u8 = 0x60;
/// Packed packet headers, tile-part header.
pub(crate) const PPT: u8 = 0x61;
/// Start of packet.
pub(crate) const SOP: u8 = 0x91;
/// End of packet header.
pub(crate) const EPH: u8 = 0x92;
/// Component registration.
pub(crate) const CRG: u8 = 0x63;
/// Comment.
pub(crate) const COM: u8 = 0x64;

/// Markers with no length field: only a two-byte 0xFF xx code.
pub(crate) fn is_delimiting(marker: u8) -> bool {
    matches!(marker, SOC | SOD | EOC | SOP | EPH)
}

/// Mnemonic for a marker code, used in error messages.
pub(crate) fn to_string(marker: u8) -> &'static str {
    match marker {
        SOC => "SOC",
        SOT => "SOT",
        SOD => "SOD",
        EOC => "EOC",
        SIZ => "SIZ",
        COD => "COD",
        COC => "COC",
        RGN => "RGN",
        QCD => "QCD",
        QCC => "QCC",
        POC => "POC",
        TLM => "TLM",
        PLM => "PLM",
        PLT => "PLT",
        PPM => "PPM",
        PPT => "PPT",
        SOP => "SOP",
        EPH => "EPH",
        CRG => "CRG",
        COM => "COM",
        _ => "UNKNOWN",
    }
}
