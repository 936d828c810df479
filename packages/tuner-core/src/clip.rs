//! FLAC clip writing for the `save`/`dump` command handlers (§4.D item 4).
//!
//! Audio file codec details are out of scope (§1) except for this one
//! writer, which the `save`/`dump` commands need to hand back a file the
//! operator can play. Samples are interleaved `f32` in `[-1.0, 1.0]`
//! (already the ring buffer's native representation); `dump` additionally
//! runs them through [`crate::utils::normalize`] per §2.A before encoding.

use std::path::Path;

use flacenc::bitsink::ByteSink;
use flacenc::component::BitRepr;
use flacenc::config::Encoder as FlacEncoderConfig;
use flacenc::error::Verify;
use flacenc::source::MemSource;

use crate::error::{TunerError, TunerResult};

const BITS_PER_SAMPLE: usize = 16;

/// Converts interleaved `f32` samples in `[-1.0, 1.0]` to 16-bit PCM and
/// writes a FLAC file at `path`, creating parent directories as needed.
pub fn write_flac(path: &Path, samples: &[f32], sample_rate: u32, channels: u16) -> TunerResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TunerError::TransientIo(e.to_string()))?;
    }

    let pcm: Vec<i32> = samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i32)
        .collect();

    let source = MemSource::from_samples(&pcm, channels as usize, BITS_PER_SAMPLE, sample_rate as usize);
    let config = FlacEncoderConfig::default()
        .into_verified()
        .map_err(|(_, e)| TunerError::Fatal(format!("invalid flac encoder config: {e:?}")))?;

    let block_size = config.block_size;
    let stream = flacenc::encode_with_fixed_block_size(&config, source, block_size)
        .map_err(|e| TunerError::TransientIo(format!("flac encode failed: {e:?}")))?;

    let mut sink = ByteSink::new();
    stream
        .write(&mut sink)
        .map_err(|e| TunerError::TransientIo(format!("flac bitstream write failed: {e:?}")))?;

    std::fs::write(path, sink.as_slice()).map_err(|e| TunerError::TransientIo(e.to_string()))?;
    Ok(())
}

/// Computes the temp clip path for a history entry (§6 filesystem outputs).
#[must_use]
pub fn temp_clip_path(appdata_dir: &str, entry_id: &str) -> std::path::PathBuf {
    std::path::Path::new(appdata_dir).join("temp").join(format!("{entry_id}.flac"))
}

/// Computes the dump path (§6 filesystem outputs).
#[must_use]
pub fn dump_path(appdata_dir: &str) -> std::path::PathBuf {
    std::path::Path::new(appdata_dir).join("dump.flac")
}

#[cfg(test)]
pub(crate) fn decode_flac_frame_count(path: &Path) -> usize {
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let file = std::fs::File::open(path).expect("flac file should open");
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    hint.with_extension("flac");

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .expect("flac file should probe");
    let mut format = probed.format;
    let track = format.tracks().first().expect("flac file should have a track").clone();
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .expect("flac track should have a registered decoder");

    let mut total_frames = 0usize;
    while let Ok(packet) = format.next_packet() {
        if let Ok(decoded) = decoder.decode(&packet) {
            total_frames += decoded.frames();
        }
    }
    total_frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_clip_path_is_namespaced_under_temp() {
        let path = temp_clip_path("/data", "abc123");
        assert_eq!(path, std::path::PathBuf::from("/data/temp/abc123.flac"));
    }

    #[test]
    fn dump_path_is_fixed() {
        assert_eq!(dump_path("/data"), std::path::PathBuf::from("/data/dump.flac"));
    }

    #[test]
    fn write_flac_produces_a_nonempty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.flac");
        let samples: Vec<f32> = (0..4410).map(|i| (i as f32 / 4410.0).sin()).collect();
        write_flac(&path, &samples, 44_100, 1).unwrap();
        let metadata = std::fs::metadata(&path).unwrap();
        assert!(metadata.len() > 0);
    }

    #[test]
    fn write_flac_round_trips_the_frame_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.flac");
        let frame_count = 4410;
        let samples: Vec<f32> = (0..frame_count).map(|i| (i as f32 / 4410.0).sin()).collect();
        write_flac(&path, &samples, 44_100, 1).unwrap();
        assert_eq!(decode_flac_frame_count(&path), frame_count);
    }
}
