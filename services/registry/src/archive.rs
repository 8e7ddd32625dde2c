//! Reading single entries out of uploaded image archives
//!
//! Images are tarballs, usually xz-compressed. Only the requested entry is ever
//! written to disk; the rest of the archive is read through and discarded.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use xz2::read::XzDecoder;

/// Largest entry that will be extracted.
pub const MAX_ENTRY_SIZE: u64 = 1024 * 1024;

const XZ_MAGIC: &[u8] = &[0xFD, b'7', b'z', b'X', b'Z', 0x00];
const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B];

/// Why an entry could not be extracted.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The archive does not contain the entry.
    #[error("archive has no {0} entry")]
    MissingEntry(String),

    /// The entry is a directory, link or other non-file.
    #[error("{0} is not a regular file")]
    NotAFile(String),

    /// The entry exceeds [`MAX_ENTRY_SIZE`].
    #[error("{entry} is {size} bytes, the limit is {MAX_ENTRY_SIZE}")]
    TooLarge {
        /// Entry name
        entry: String,
        /// Declared size
        size: u64,
    },

    /// The file is not a readable (compressed) tar archive.
    #[error("unreadable archive: {0}")]
    Corrupt(#[source] io::Error),

    /// Local I/O failed while opening the archive or writing the entry.
    #[error("extracting entry: {0}")]
    Io(#[source] io::Error),
}

impl ArchiveError {
    /// Whether the failure is caused by the archive content rather than the host.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, ArchiveError::Io(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    Xz,
    Gzip,
    None,
}

fn detect(file: &mut File) -> io::Result<Compression> {
    let mut magic = [0u8; 6];
    let mut read = 0;
    while read < magic.len() {
        match file.read(&mut magic[read..])? {
            0 => break,
            n => read += n,
        }
    }
    file.seek(SeekFrom::Start(0))?;

    let magic = &magic[..read];
    Ok(if magic.starts_with(XZ_MAGIC) {
        Compression::Xz
    } else if magic.starts_with(GZIP_MAGIC) {
        Compression::Gzip
    } else {
        Compression::None
    })
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches("./").trim_start_matches('/')
}

/// Extract `entry` from the archive at `archive` into `destination`.
///
/// The entry is written as `destination/<file name of entry>` regardless of
/// where it sits inside the archive. Blocking; see [`extract_entry_blocking`]
/// for use from async code.
pub fn extract_entry(
    archive: &Utf8Path,
    entry: &str,
    destination: &Utf8Path,
) -> Result<Utf8PathBuf, ArchiveError> {
    let mut file = File::open(archive).map_err(ArchiveError::Io)?;
    let compression = detect(&mut file).map_err(ArchiveError::Io)?;
    tracing::trace!(%archive, ?compression, "inspecting archive");

    let reader = BufReader::new(file);
    match compression {
        Compression::Xz => find_entry(XzDecoder::new(reader), entry, destination),
        Compression::Gzip => find_entry(GzDecoder::new(reader), entry, destination),
        Compression::None => find_entry(reader, entry, destination),
    }
}

/// [`extract_entry`] on the blocking thread pool.
pub async fn extract_entry_blocking(
    archive: &Utf8Path,
    entry: &str,
    destination: &Utf8Path,
) -> Result<Utf8PathBuf, ArchiveError> {
    let archive = archive.to_owned();
    let entry = entry.to_owned();
    let destination = destination.to_owned();
    tokio::task::spawn_blocking(move || extract_entry(&archive, &entry, &destination))
        .await
        .map_err(|err| ArchiveError::Io(io::Error::other(err)))?
}

fn find_entry<R: Read>(
    reader: R,
    wanted: &str,
    destination: &Utf8Path,
) -> Result<Utf8PathBuf, ArchiveError> {
    let wanted = normalize(wanted);
    let file_name = Utf8Path::new(wanted)
        .file_name()
        .ok_or_else(|| ArchiveError::MissingEntry(wanted.to_string()))?;

    let mut archive = Archive::new(reader);
    for item in archive.entries().map_err(ArchiveError::Corrupt)? {
        let mut item = item.map_err(ArchiveError::Corrupt)?;
        let matches = {
            let path = item.path().map_err(ArchiveError::Corrupt)?;
            path.to_str().map(normalize) == Some(wanted)
        };
        if !matches {
            continue;
        }

        if item.header().entry_type() != EntryType::Regular {
            return Err(ArchiveError::NotAFile(wanted.to_string()));
        }

        let size = item.size();
        if size > MAX_ENTRY_SIZE {
            return Err(ArchiveError::TooLarge {
                entry: wanted.to_string(),
                size,
            });
        }

        let target = destination.join(file_name);
        let mut out = File::create(&target).map_err(ArchiveError::Io)?;
        // Never trust the header alone for the size bound.
        let copied = io::copy(&mut (&mut item).take(MAX_ENTRY_SIZE + 1), &mut out);
        match copied {
            Ok(n) if n > MAX_ENTRY_SIZE => {
                return Err(ArchiveError::TooLarge {
                    entry: wanted.to_string(),
                    size: n,
                });
            }
            Ok(_) => {}
            Err(err) => return Err(ArchiveError::Corrupt(err)),
        }

        return Ok(target);
    }

    Err(ArchiveError::MissingEntry(wanted.to_string()))
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Builders for test archives.

    use std::io::Write;

    use flate2::write::GzEncoder;
    use xz2::write::XzEncoder;

    /// A tar stream containing `entries` as regular files.
    pub fn tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    /// `tar` compressed with xz.
    pub fn tar_xz(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut encoder = XzEncoder::new(Vec::new(), 6);
        encoder.write_all(&tar(entries)).unwrap();
        encoder.finish().unwrap()
    }

    /// `tar` compressed with gzip.
    pub fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar(entries)).unwrap();
        encoder.finish().unwrap()
    }
}
