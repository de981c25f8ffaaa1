use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

const USTAR_MAGIC_OFFSET: u64 = 257;
const USTAR_MAGIC: &[u8] = b"ustar";

/// Archive compression, identified by magic bytes rather than file
/// extension (`spec.md §4.1`: callers may hand the cache an archive with an
/// arbitrary or missing suffix).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zstd,
    Gzip,
    Bzip2,
    Xz,
    None,
}

impl Compression {
    pub fn detect(path: &Path) -> std::io::Result<Self> {
        let mut header = [0u8; 16];
        let mut file = File::open(path)?;
        let n = file.read(&mut header)?;
        let header = &header[..n];

        match infer::get(header) {
            Some(kind) => match kind.mime_type() {
                "application/zstd" => Ok(Compression::Zstd),
                "application/gzip" => Ok(Compression::Gzip),
                "application/x-bzip2" => Ok(Compression::Bzip2),
                "application/x-xz" => Ok(Compression::Xz),
                _ if is_plain_tar(&mut file)? => Ok(Compression::None),
                _ => Err(unknown_compression(path)),
            },
            None if is_plain_tar(&mut file)? => Ok(Compression::None),
            None => Err(unknown_compression(path)),
        }
    }
}

/// A bare (uncompressed) tar has no magic bytes at offset 0; its "ustar"
/// marker lives at offset 257 in the POSIX header of the first entry.
fn is_plain_tar(file: &mut File) -> std::io::Result<bool> {
    let mut magic = [0u8; USTAR_MAGIC.len()];
    if file.seek(SeekFrom::Start(USTAR_MAGIC_OFFSET)).is_err() {
        return Ok(false);
    }
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == USTAR_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn unknown_compression(path: &Path) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("unknown compression format for {}", path.display()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f
    }

    #[test]
    fn detects_gzip() {
        let f = write(&[0x1f, 0x8b, 0x08, 0x00]);
        assert_eq!(Compression::detect(f.path()).unwrap(), Compression::Gzip);
    }

    #[test]
    fn detects_zstd() {
        let f = write(&[0x28, 0xb5, 0x2f, 0xfd]);
        assert_eq!(Compression::detect(f.path()).unwrap(), Compression::Zstd);
    }

    #[test]
    fn detects_bzip2() {
        let f = write(b"BZh91AY&SY");
        assert_eq!(Compression::detect(f.path()).unwrap(), Compression::Bzip2);
    }

    #[test]
    fn detects_xz() {
        let f = write(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]);
        assert_eq!(Compression::detect(f.path()).unwrap(), Compression::Xz);
    }

    #[test]
    fn detects_plain_tar_by_ustar_magic() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let mut builder = tar::Builder::new(f.reopen().unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_cksum();
        builder.append_data(&mut header, "empty.txt", &b""[..]).unwrap();
        builder.into_inner().unwrap();

        assert_eq!(Compression::detect(f.path()).unwrap(), Compression::None);
    }

    #[test]
    fn rejects_unrecognized_bytes() {
        let f = write(b"not a tar, not a known compressed format at all");
        assert!(Compression::detect(f.path()).is_err());
    }
}
