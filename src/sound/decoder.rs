use super::{MemorySound, SampleFormat, SampleSpec};
use crate::error::{ErrorKind, Result};
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::SampleFormat as SymphoniaSampleFormat;
use tracing::{debug, instrument, trace, warn};

const LOG_TARGET: &str = "r_chime::sound::decoder";

fn map_symphonia_error(err: &SymphoniaError) -> ErrorKind {
    match err {
        SymphoniaError::IoError(io_err) => ErrorKind::from_io(io_err),
        SymphoniaError::Unsupported(_) => ErrorKind::NotSupported,
        SymphoniaError::LimitError(_) => ErrorKind::TooBig,
        _ => ErrorKind::IO,
    }
}

/// Decodes a whole sound file into interleaved PCM.
///
/// Unsigned 8 bit sources keep their layout, everything else is converted to
/// native-endian signed 16 bit.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn decode_file(path: &Path) -> Result<MemorySound> {
    let file = File::open(path).map_err(|e| {
        debug!(target: LOG_TARGET, "Cannot open {}: {}", path.display(), e);
        ErrorKind::from_io(&e)
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| {
            debug!(target: LOG_TARGET, "Probe failed for {}: {}", path.display(), e);
            map_symphonia_error(&e)
        })?;
    let mut reader = probed.format;

    let track = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(ErrorKind::NotSupported)?
        .clone();

    let format = match track.codec_params.sample_format {
        Some(SymphoniaSampleFormat::U8) => SampleFormat::U8,
        _ => SampleFormat::S16Ne,
    };
    let rate = track.codec_params.sample_rate.ok_or(ErrorKind::NotSupported)?;
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count())
        .ok_or(ErrorKind::NotSupported)?;
    let spec = SampleSpec::new(
        format,
        rate,
        u8::try_from(channels).map_err(|_| ErrorKind::NotSupported)?,
    );
    if !spec.is_valid() {
        return Err(ErrorKind::NotSupported);
    }

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| map_symphonia_error(&e))?;

    let mut pcm: Vec<u8> = Vec::new();
    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                trace!(target: LOG_TARGET, "End of stream reached.");
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(map_symphonia_error(&e)),
        };
        if packet.track_id() != track.id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(msg)) => {
                warn!(target: LOG_TARGET, "Skipping undecodable packet: {}", msg);
                continue;
            }
            Err(e) => return Err(map_symphonia_error(&e)),
        };

        let buf_spec = *decoded.spec();
        let capacity = decoded.capacity() as u64;
        match format {
            SampleFormat::U8 => {
                let mut buf = SampleBuffer::<u8>::new(capacity, buf_spec);
                buf.copy_interleaved_ref(decoded);
                pcm.extend_from_slice(buf.samples());
            }
            _ => {
                let mut buf = SampleBuffer::<i16>::new(capacity, buf_spec);
                buf.copy_interleaved_ref(decoded);
                for sample in buf.samples() {
                    pcm.extend_from_slice(&sample.to_ne_bytes());
                }
            }
        }
    }

    let usable = pcm.len() - pcm.len() % spec.frame_size();
    pcm.truncate(usable);
    debug!(
        target: LOG_TARGET,
        "Decoded {} ({:?}, {} Hz, {} ch, {} bytes)",
        path.display(),
        spec.format,
        spec.rate,
        spec.channels,
        pcm.len()
    );
    MemorySound::new(spec, pcm)
}
