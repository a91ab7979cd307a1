//! Stateless audio conversions used by the call bridge.
//!
//! Telephony platforms hand us either G.711 μ-law (one byte per sample) or
//! 16-bit little-endian linear PCM. Everything downstream of the parser works
//! on PCM16 LE, and recordings are framed as canonical 44 byte RIFF/WAVE files.

use once_cell::sync::Lazy;

pub const WAV_HEADER_LEN: usize = 44;
pub const BYTES_PER_SAMPLE: usize = 2;
/// Largest PCM payload whose RIFF chunk size still fits in 32 bits.
pub const MAX_WAV_DATA_LEN: u32 = u32::MAX - 36;

const MULAW_BIAS: i16 = 0x84;

static MULAW_TABLE: Lazy<[i16; 256]> = Lazy::new(|| {
    let mut table = [0i16; 256];
    for (byte, slot) in table.iter_mut().enumerate() {
        *slot = expand_mulaw(byte as u8);
    }
    table
});

fn expand_mulaw(encoded: u8) -> i16 {
    let inverted = !encoded;
    let exponent = (inverted & 0x70) >> 4;
    let mantissa = (inverted & 0x0F) as i16;
    let magnitude = ((mantissa << 3) + MULAW_BIAS) << exponent;
    if inverted & 0x80 != 0 {
        MULAW_BIAS - magnitude
    } else {
        magnitude - MULAW_BIAS
    }
}

pub fn decode_mulaw_sample(encoded: u8) -> i16 {
    MULAW_TABLE[encoded as usize]
}

/// Expands μ-law bytes to PCM16 LE. The output is always twice the input length.
pub fn mulaw_to_linear16(input: &[u8]) -> Vec<u8> {
    input
        .iter()
        .flat_map(|&byte| decode_mulaw_sample(byte).to_le_bytes())
        .collect()
}

/// Canonical RIFF/WAVE header for 16-bit PCM.
///
/// `data_len` is the exact number of PCM bytes that follow the header; both
/// size fields are derived from it. Returns `None` above [`MAX_WAV_DATA_LEN`].
pub fn wav_header(data_len: u32, sample_rate: u32, channels: u16) -> Option<[u8; WAV_HEADER_LEN]> {
    let riff_len = data_len.checked_add(36)?;
    let bits_per_sample: u16 = (BYTES_PER_SAMPLE * 8) as u16;
    let block_align = channels * BYTES_PER_SAMPLE as u16;
    let byte_rate = sample_rate * block_align as u32;

    let mut header = [0u8; WAV_HEADER_LEN];
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&riff_len.to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes());
    header[22..24].copy_from_slice(&channels.to_le_bytes());
    header[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&bits_per_sample.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_len.to_le_bytes());
    Some(header)
}

/// Makes a call id safe to use as a file name and object key.
pub fn posixify_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}
