//! PCM conversion helpers shared by capture, playback and the wire protocol.

use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree};

/// Sample rate of microphone audio on the wire (mono PCM16).
pub const MIC_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of synthesized audio returned by the model (mono PCM16).
pub const SYNTH_SAMPLE_RATE: u32 = 24_000;

/// Frames per capture block handed to the send loop.
pub const CAPTURE_BLOCK_FRAMES: usize = 4096;

/// Creates a mono resampler converting between two sample rates.
pub fn create_resampler(
    in_rate: u32,
    out_rate: u32,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_rate as f64 / in_rate as f64,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Converts f32 samples to little-endian PCM16 bytes and base64-encodes them,
/// clamping to the representable range.
pub fn encode_f32_to_base64_i16(pcm: &[f32]) -> String {
    let bytes: Vec<u8> = pcm
        .iter()
        .flat_map(|&sample| {
            let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            v.to_le_bytes()
        })
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&bytes)
}

/// Decodes a base64 PCM16 payload into normalized f32 samples.
///
/// Trailing odd bytes are dropped; a malformed base64 payload is an error so
/// the caller can skip the chunk without tearing the session down.
pub fn decode_f32_from_base64_i16(payload: &str) -> Result<Vec<f32>, base64::DecodeError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload)?;
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            (v as f32 / 32768.0).clamp(-1.0, 1.0)
        })
        .collect())
}

/// Maps a normalized sample onto the unsigned byte range used by the
/// analysis tap, centered on 128.
pub fn f32_to_tap_byte(sample: f32) -> u8 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * 127.0 + 128.0) as u8
}
