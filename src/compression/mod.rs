//! Streaming compression, decompression and checksums for dump files.
//!
//! Every codec reads and writes in fixed 256 KiB chunks so memory stays flat
//! regardless of dump size. A failed run never leaves a partial output file.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{Result, VaultError};
use crate::models::CompressionAlgorithm;

pub const CHUNK_SIZE: usize = 256 * 1024;

const GZIP_MAX_LEVEL: i32 = 9;
const LZ4_MAX_LEVEL: i32 = 16;
const ZSTD_MAX_LEVEL: i32 = 22;

/// Infers the algorithm from the filename suffix alone. Unknown suffixes mean `None`.
pub fn detect_algorithm(path: &Path) -> CompressionAlgorithm {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return CompressionAlgorithm::None;
    };
    let suffix = format!(".{}", ext.to_ascii_lowercase());
    CompressionAlgorithm::ALL
        .into_iter()
        .find(|algo| !algo.extension().is_empty() && algo.extension() == suffix)
        .unwrap_or(CompressionAlgorithm::None)
}

/// `input` with the algorithm's suffix appended: `dump.sql` -> `dump.sql.zst`.
pub fn compressed_path(input: &Path, algorithm: CompressionAlgorithm) -> PathBuf {
    let mut name = OsString::from(input.as_os_str());
    name.push(algorithm.extension());
    PathBuf::from(name)
}

fn clamp_level(algorithm: CompressionAlgorithm, level: i32) -> i32 {
    let max = match algorithm {
        CompressionAlgorithm::Gzip => GZIP_MAX_LEVEL,
        CompressionAlgorithm::Lz4 => LZ4_MAX_LEVEL,
        CompressionAlgorithm::Zstd => ZSTD_MAX_LEVEL,
        CompressionAlgorithm::None => 0,
    };
    level.clamp(1.min(max), max)
}

/// Compresses `input` with `algorithm`, writing to `output` or `input` + suffix.
///
/// With `CompressionAlgorithm::None` this is the identity (no copy) unless a
/// distinct `output` is requested, in which case the file is copied there.
pub fn compress(
    input: &Path,
    algorithm: CompressionAlgorithm,
    level: i32,
    output: Option<&Path>,
) -> Result<PathBuf> {
    if algorithm == CompressionAlgorithm::None {
        return match output {
            Some(out) if !same_file(input, out) => {
                fs::copy(input, out).map_err(|e| {
                    VaultError::Compression(format!(
                        "failed to copy {} to {}: {e}",
                        input.display(),
                        out.display()
                    ))
                })?;
                Ok(out.to_path_buf())
            }
            _ => Ok(input.to_path_buf()),
        };
    }

    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| compressed_path(input, algorithm));
    reject_in_place(input, &output)?;
    let level = clamp_level(algorithm, level);

    info!(
        input = %input.display(),
        output = %output.display(),
        algorithm = %algorithm,
        level,
        "compressing file"
    );

    let source = File::open(input).map_err(|e| {
        VaultError::Compression(format!("failed to open {}: {e}", input.display()))
    })?;

    let reader = BufReader::with_capacity(CHUNK_SIZE, source);
    let outcome = write_atomically(&output, |sink| encode_stream(reader, sink, algorithm, level));
    if let Err(e) = outcome {
        return Err(VaultError::Compression(format!(
            "failed to compress {} with {algorithm}: {e}",
            input.display()
        )));
    }

    let original = file_len(input);
    let compressed = file_len(&output);
    let ratio = if original > 0 {
        compressed as f64 / original as f64
    } else {
        0.0
    };
    info!(
        original_bytes = original,
        compressed_bytes = compressed,
        ratio = format!("{:.2}%", ratio * 100.0),
        "compression complete"
    );
    Ok(output)
}

/// Decompresses `input`, detecting the algorithm from its suffix.
///
/// Files without a known suffix are returned unchanged. The default output is
/// `input` with the compression suffix stripped.
pub fn decompress(input: &Path, output: Option<&Path>) -> Result<PathBuf> {
    let algorithm = detect_algorithm(input);
    if algorithm == CompressionAlgorithm::None {
        return Ok(input.to_path_buf());
    }

    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| input.with_extension(""));
    reject_in_place(input, &output)?;

    info!(
        input = %input.display(),
        output = %output.display(),
        algorithm = %algorithm,
        "decompressing file"
    );

    let source = File::open(input).map_err(|e| {
        VaultError::Compression(format!("failed to open {}: {e}", input.display()))
    })?;

    let reader = BufReader::with_capacity(CHUNK_SIZE, source);
    let outcome = write_atomically(&output, |sink| decode_stream(reader, sink, algorithm));
    if let Err(e) = outcome {
        return Err(VaultError::Compression(format!(
            "failed to decompress {} with {algorithm}: {e}",
            input.display()
        )));
    }

    info!(output_bytes = file_len(&output), "decompression complete");
    Ok(output)
}

/// SHA-256 of the file contents as 64 lowercase hex characters.
pub fn checksum(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| {
        VaultError::Compression(format!("failed to open {} for checksum: {e}", path.display()))
    })?;
    let mut reader = BufReader::with_capacity(CHUNK_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).map_err(|e| {
            VaultError::Compression(format!("failed to read {} for checksum: {e}", path.display()))
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hex::encode(hasher.finalize());
    debug!(file = %path.display(), sha256 = %digest, "checksum computed");
    Ok(digest)
}

fn encode_stream<R: Read, W: Write>(
    mut reader: R,
    writer: W,
    algorithm: CompressionAlgorithm,
    level: i32,
) -> io::Result<()> {
    match algorithm {
        CompressionAlgorithm::Zstd => {
            let mut encoder = zstd::stream::Encoder::new(writer, level)?;
            copy_chunked(&mut reader, &mut encoder)?;
            encoder.finish()?.flush()
        }
        CompressionAlgorithm::Gzip => {
            let mut encoder = GzEncoder::new(writer, Compression::new(level as u32));
            copy_chunked(&mut reader, &mut encoder)?;
            encoder.finish()?.flush()
        }
        CompressionAlgorithm::Lz4 => {
            let mut encoder = lz4::EncoderBuilder::new()
                .level(level as u32)
                .build(writer)?;
            copy_chunked(&mut reader, &mut encoder)?;
            let (mut inner, result) = encoder.finish();
            result?;
            inner.flush()
        }
        CompressionAlgorithm::None => {
            let mut writer = writer;
            copy_chunked(&mut reader, &mut writer)?;
            writer.flush()
        }
    }
}

fn decode_stream<R: BufRead, W: Write>(
    reader: R,
    mut writer: W,
    algorithm: CompressionAlgorithm,
) -> io::Result<()> {
    match algorithm {
        CompressionAlgorithm::Zstd => {
            let mut decoder = zstd::stream::Decoder::with_buffer(reader)?;
            copy_chunked(&mut decoder, &mut writer)?;
        }
        CompressionAlgorithm::Gzip => {
            let mut decoder = GzDecoder::new(reader);
            copy_chunked(&mut decoder, &mut writer)?;
        }
        CompressionAlgorithm::Lz4 => {
            let mut decoder = lz4::Decoder::new(reader)?;
            copy_chunked(&mut decoder, &mut writer)?;
        }
        CompressionAlgorithm::None => {
            let mut reader = reader;
            copy_chunked(&mut reader, &mut writer)?;
        }
    }
    writer.flush()
}

fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn reject_in_place(input: &Path, output: &Path) -> Result<()> {
    if same_file(input, output) {
        return Err(VaultError::Compression(format!(
            "output {} is the input file",
            output.display()
        )));
    }
    Ok(())
}

/// Streams into a hidden sibling of `output` and renames it into place once
/// `write` has finished and flushed. The sibling is removed on failure.
fn write_atomically<F>(output: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(BufWriter<File>) -> io::Result<()>,
{
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let partial = output.with_file_name(format!(".{name}.{}.partial", Uuid::new_v4().simple()));
    let outcome = File::create(&partial)
        .and_then(|sink| write(BufWriter::new(sink)))
        .and_then(|()| fs::rename(&partial, output));
    if outcome.is_err() {
        let _ = fs::remove_file(&partial);
    }
    outcome
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic, poorly compressible bytes with some repetition mixed in.
    fn sample_bytes(len: usize) -> Vec<u8> {
        let mut state: u32 = 0x2545_f491;
        (0..len)
            .map(|i| {
                if i % 7 == 0 {
                    b'a'
                } else {
                    state ^= state << 13;
                    state ^= state >> 17;
                    state ^= state << 5;
                    (state & 0xff) as u8
                }
            })
            .collect()
    }

    #[test]
    fn round_trip_every_algorithm() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        // Larger than one chunk so the streaming loop runs more than once.
        let data = sample_bytes(CHUNK_SIZE * 2 + 1234);

        for algorithm in CompressionAlgorithm::ALL {
            let input = tmp.path().join(format!("dump_{algorithm}.sql"));
            fs::write(&input, &data)?;

            let compressed = compress(&input, algorithm, 3, None)?;
            assert_eq!(detect_algorithm(&compressed), algorithm);

            let restored_path = tmp.path().join(format!("restored_{algorithm}.sql"));
            let restored = if algorithm == CompressionAlgorithm::None {
                decompress(&compressed, None)?
            } else {
                decompress(&compressed, Some(&restored_path))?
            };
            assert_eq!(fs::read(&restored)?, data, "round trip failed for {algorithm}");
        }
        Ok(())
    }

    #[test]
    fn empty_input_round_trips() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let input = tmp.path().join("empty.sql");
        fs::write(&input, b"")?;
        let compressed = compress(&input, CompressionAlgorithm::Zstd, 3, None)?;
        fs::remove_file(&input)?;
        let restored = decompress(&compressed, None)?;
        assert_eq!(restored, input);
        assert!(fs::read(&restored)?.is_empty());
        Ok(())
    }

    #[test]
    fn default_paths_append_and_strip_suffix() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let input = tmp.path().join("sqlite_app_20240101_000000.db");
        fs::write(&input, b"payload")?;

        let compressed = compress(&input, CompressionAlgorithm::Gzip, 6, None)?;
        assert_eq!(compressed, tmp.path().join("sqlite_app_20240101_000000.db.gz"));

        fs::remove_file(&input)?;
        let restored = decompress(&compressed, None)?;
        assert_eq!(restored, input);
        assert_eq!(fs::read(restored)?, b"payload");
        Ok(())
    }

    #[test]
    fn none_is_identity_without_copy() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let input = tmp.path().join("plain.sql");
        fs::write(&input, b"select 1;")?;

        assert_eq!(compress(&input, CompressionAlgorithm::None, 3, None)?, input);
        assert_eq!(compress(&input, CompressionAlgorithm::None, 3, Some(&input))?, input);
        assert_eq!(decompress(&input, None)?, input);
        assert_eq!(fs::read_dir(tmp.path())?.count(), 1);

        let copy = tmp.path().join("copy.sql");
        assert_eq!(compress(&input, CompressionAlgorithm::None, 3, Some(&copy))?, copy);
        assert_eq!(fs::read(copy)?, b"select 1;");
        Ok(())
    }

    #[test]
    fn out_of_range_levels_are_clamped() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let input = tmp.path().join("dump.sql");
        let data = sample_bytes(10_000);
        fs::write(&input, &data)?;

        for algorithm in [CompressionAlgorithm::Gzip, CompressionAlgorithm::Lz4] {
            let out = tmp.path().join(format!("max{}", algorithm.extension()));
            compress(&input, algorithm, 22, Some(&out))?;
            let back = tmp.path().join(format!("back_{algorithm}"));
            decompress(&out, Some(&back))?;
            assert_eq!(fs::read(back)?, data);
        }
        assert_eq!(clamp_level(CompressionAlgorithm::Gzip, 22), 9);
        assert_eq!(clamp_level(CompressionAlgorithm::Lz4, 22), 16);
        assert_eq!(clamp_level(CompressionAlgorithm::Zstd, 22), 22);
        Ok(())
    }

    #[test]
    fn detect_uses_suffix_only() {
        assert_eq!(detect_algorithm(Path::new("a.sql.zst")), CompressionAlgorithm::Zstd);
        assert_eq!(detect_algorithm(Path::new("a.dump.GZ")), CompressionAlgorithm::Gzip);
        assert_eq!(detect_algorithm(Path::new("a.archive.lz4")), CompressionAlgorithm::Lz4);
        assert_eq!(detect_algorithm(Path::new("a.db")), CompressionAlgorithm::None);
        assert_eq!(detect_algorithm(Path::new("noext")), CompressionAlgorithm::None);
        assert_eq!(detect_algorithm(Path::new("gz")), CompressionAlgorithm::None);
    }

    #[test]
    fn corrupt_input_leaves_no_partial_output() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let input = tmp.path().join("broken.sql.zst");
        fs::write(&input, b"definitely not a zstd frame")?;
        let output = tmp.path().join("broken.sql");

        let err = decompress(&input, Some(&output)).unwrap_err();
        assert!(matches!(err, VaultError::Compression(_)));
        assert!(!output.exists());
        assert_eq!(fs::read_dir(tmp.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn writing_over_the_input_is_refused() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let input = tmp.path().join("dump.sql");
        let data = sample_bytes(29_000);
        fs::write(&input, &data)?;

        let err = compress(&input, CompressionAlgorithm::Zstd, 3, Some(&input)).unwrap_err();
        assert!(matches!(err, VaultError::Compression(_)));
        // Same file through a different spelling of the path.
        let dotted = tmp.path().join(".").join("dump.sql");
        assert!(compress(&input, CompressionAlgorithm::Gzip, 6, Some(&dotted)).is_err());
        assert_eq!(fs::read(&input)?, data);

        let packed = compress(&input, CompressionAlgorithm::Zstd, 3, None)?;
        let packed_bytes = fs::read(&packed)?;
        assert!(decompress(&packed, Some(&packed)).is_err());
        assert_eq!(fs::read(&packed)?, packed_bytes);

        let back = decompress(&packed, Some(&tmp.path().join("back.sql")))?;
        assert_eq!(fs::read(back)?, data);
        Ok(())
    }

    #[test]
    fn existing_output_is_replaced_whole() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let input = tmp.path().join("dump.sql");
        fs::write(&input, b"fresh dump")?;
        let output = tmp.path().join("dump.sql.gz");
        fs::write(&output, vec![0u8; 4096])?;

        compress(&input, CompressionAlgorithm::Gzip, 6, None)?;
        let back = decompress(&output, Some(&tmp.path().join("back.sql")))?;
        assert_eq!(fs::read(back)?, b"fresh dump");
        let names: Vec<String> = fs::read_dir(tmp.path())?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".partial")), "{names:?}");
        Ok(())
    }

    #[test]
    fn missing_input_is_a_compression_error() {
        let err = compress(
            Path::new("/nonexistent/dir/dump.sql"),
            CompressionAlgorithm::Zstd,
            3,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, VaultError::Compression(_)));
    }

    #[test]
    fn checksum_is_deterministic_and_content_sensitive() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::write(&a, b"abc")?;
        fs::write(&b, b"abd")?;

        let first = checksum(&a)?;
        assert_eq!(first, checksum(&a)?);
        assert_eq!(first.len(), 64);
        assert_eq!(
            first,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(first, checksum(&b)?);
        Ok(())
    }

    #[test]
    fn checksum_matches_one_shot_hash_across_chunks() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let data = sample_bytes(CHUNK_SIZE * 3 + 17);
        let path = tmp.path().join("big");
        fs::write(&path, &data)?;
        assert_eq!(checksum(&path)?, hex::encode(Sha256::digest(&data)));
        Ok(())
    }
}
