//! Stream compression with format auto-detection.

use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, format_err, Context, Error};

use crate::io::WriteClose;

/// Number of leading bytes inspected for magic detection.
const MAGIC_LEN: u64 = 8;

const MAGIC_GZIP: &[u8] = &[0x1f, 0x8b];
const MAGIC_BZIP2: &[u8] = b"BZh";
const MAGIC_XZ: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const MAGIC_ZSTD: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const MAGIC_LZ4: &[u8] = &[0x04, 0x22, 0x4d, 0x18];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    Auto,
    None,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
    Lz4,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Auto => "auto",
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
            Compression::Lz4 => "lz4",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "auto" => Compression::Auto,
            "none" => Compression::None,
            "gzip" | "gz" => Compression::Gzip,
            "bzip2" | "bz2" => Compression::Bzip2,
            "xz" => Compression::Xz,
            "zstd" | "zst" => Compression::Zstd,
            "lz4" => Compression::Lz4,
            other => bail!("unsupported compression type {:?}", other),
        })
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CompressionError {
    #[error("compression level {0} out of range, expected 1-9")]
    InvalidLevel(u32),
}

/// Validate an optional compression level, which must be within `1..=9`.
pub fn check_level(level: Option<u32>) -> Result<Option<u32>, CompressionError> {
    match level {
        Some(level) if !(1..=9).contains(&level) => Err(CompressionError::InvalidLevel(level)),
        other => Ok(other),
    }
}

/// Match the leading bytes of a stream against the known magic numbers.
pub fn detect_by_magic(magic: &[u8]) -> Option<Compression> {
    [
        (MAGIC_GZIP, Compression::Gzip),
        (MAGIC_BZIP2, Compression::Bzip2),
        (MAGIC_XZ, Compression::Xz),
        (MAGIC_ZSTD, Compression::Zstd),
        (MAGIC_LZ4, Compression::Lz4),
    ]
    .into_iter()
    .find(|(prefix, _)| magic.starts_with(prefix))
    .map(|(_, compression)| compression)
}

/// Guess the compression from a file name or object key.
pub fn detect_by_extension(name: &str) -> Option<Compression> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "gz" | "tgz" => Some(Compression::Gzip),
        "bz2" | "tbz2" | "tbz" => Some(Compression::Bzip2),
        "xz" | "txz" => Some(Compression::Xz),
        "zst" | "tzst" | "zstd" => Some(Compression::Zstd),
        "lz4" | "tlz4" => Some(Compression::Lz4),
        _ => None,
    }
}

enum Encoder<W: Write> {
    Gzip(flate2::write::GzEncoder<W>),
    Bzip2(bzip2::write::BzEncoder<W>),
    Xz(xz2::write::XzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Lz4(lz4::Encoder<W>),
}

/// Compressing writer stacked on top of a closable sink.
///
/// Closing finishes the codec stream and then closes the sink. Both steps are always
/// attempted, the first error is reported.
pub struct CompressWriter<W: WriteClose> {
    compression: Compression,
    encoder: Option<Encoder<W>>,
}

impl<W: WriteClose> CompressWriter<W> {
    fn encoder(&mut self) -> io::Result<&mut dyn Write> {
        match self.encoder.as_mut() {
            Some(Encoder::Gzip(enc)) => Ok(enc),
            Some(Encoder::Bzip2(enc)) => Ok(enc),
            Some(Encoder::Xz(enc)) => Ok(enc),
            Some(Encoder::Zstd(enc)) => Ok(enc),
            Some(Encoder::Lz4(enc)) => Ok(enc),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write to closed compression stream",
            )),
        }
    }
}

impl<W: WriteClose> Write for CompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder()?.flush()
    }
}

impl<W: WriteClose> WriteClose for CompressWriter<W> {
    fn close(&mut self) -> Result<(), Error> {
        let (finished, closed) = match self.encoder.take() {
            None => return Ok(()),
            Some(Encoder::Gzip(mut enc)) => (enc.try_finish(), enc.get_mut().close()),
            Some(Encoder::Bzip2(mut enc)) => (enc.try_finish(), enc.get_mut().close()),
            Some(Encoder::Xz(mut enc)) => (enc.try_finish(), enc.get_mut().close()),
            Some(Encoder::Zstd(mut enc)) => (enc.do_finish(), enc.get_mut().close()),
            Some(Encoder::Lz4(enc)) => {
                let (mut sink, finished) = enc.finish();
                (finished, sink.close())
            }
        };
        finished.with_context(|| format!("failed to finish {} stream", self.compression))?;
        closed
    }
}

/// Wrap `sink` with a compressing writer.
///
/// `Auto` and `None` hand back the sink itself. The level is validated before anything is
/// constructed, `None` selects the codec default.
pub fn new_writer<W>(
    sink: W,
    compression: Compression,
    level: Option<u32>,
) -> Result<Box<dyn WriteClose>, Error>
where
    W: WriteClose + 'static,
{
    let level = check_level(level)?;

    let encoder = match compression {
        Compression::Auto | Compression::None => return Ok(Box::new(sink)),
        Compression::Gzip => {
            let level = level.map(flate2::Compression::new).unwrap_or_default();
            Encoder::Gzip(flate2::write::GzEncoder::new(sink, level))
        }
        Compression::Bzip2 => {
            let level = level.map(bzip2::Compression::new).unwrap_or_default();
            Encoder::Bzip2(bzip2::write::BzEncoder::new(sink, level))
        }
        Compression::Xz => Encoder::Xz(xz2::write::XzEncoder::new(sink, level.unwrap_or(6))),
        Compression::Zstd => Encoder::Zstd(
            zstd::stream::write::Encoder::new(sink, level.unwrap_or(0) as i32)
                .context("failed to set up zstd encoder")?,
        ),
        Compression::Lz4 => Encoder::Lz4(
            lz4::EncoderBuilder::new()
                .level(level.unwrap_or(0))
                .build(sink)
                .context("failed to set up lz4 encoder")?,
        ),
    };

    Ok(Box::new(CompressWriter {
        compression,
        encoder: Some(encoder),
    }))
}

/// Tags decoder failures with the codec they came from.
struct DecodeReader<R> {
    compression: Compression,
    inner: R,
}

impl<R: Read> Read for DecodeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("{} decode error: {}", self.compression, err),
            )
        })
    }
}

fn wrap_reader<R>(source: R, compression: Compression) -> Result<Box<dyn Read + Send>, Error>
where
    R: Read + Send + 'static,
{
    let reader: Box<dyn Read + Send> = match compression {
        Compression::Auto | Compression::None => return Ok(Box::new(source)),
        Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(source)),
        Compression::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(source)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(source)),
        Compression::Zstd => Box::new(
            zstd::stream::read::Decoder::new(source)
                .map_err(|err| format_err!("failed to set up zstd decoder - {}", err))?,
        ),
        Compression::Lz4 => Box::new(
            lz4::Decoder::new(source)
                .map_err(|err| format_err!("failed to set up lz4 decoder - {}", err))?,
        ),
    };

    Ok(Box::new(DecodeReader {
        compression,
        inner: reader,
    }))
}

/// Wrap `source` with a decompressing reader.
///
/// An explicit compression is used as is. With `Auto` the first bytes are peeked and matched
/// against the magic table, then `hint` (a file name or key) is checked for a known
/// extension, and finally the stream is taken as uncompressed. Returns the reader together
/// with the compression actually used.
pub fn new_reader<R>(
    mut source: R,
    compression: Compression,
    hint: &str,
) -> Result<(Box<dyn Read + Send>, Compression), Error>
where
    R: Read + Send + 'static,
{
    if compression != Compression::Auto {
        return Ok((wrap_reader(source, compression)?, compression));
    }

    let mut magic = Vec::with_capacity(MAGIC_LEN as usize);
    source
        .by_ref()
        .take(MAGIC_LEN)
        .read_to_end(&mut magic)
        .context("failed to read archive header")?;

    let detected = detect_by_magic(&magic)
        .or_else(|| detect_by_extension(hint))
        .unwrap_or(Compression::None);
    log::debug!("detected {} compression for {:?}", detected, hint);

    let source = Cursor::new(magic).chain(source);
    Ok((wrap_reader(source, detected)?, detected))
}
