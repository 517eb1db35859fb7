//! Raw firmware image source.
//!
//! A firmware image is a flat binary that is streamed to the target in
//! chunks. The application build embeds a small version record at a fixed
//! offset:
//!
//! ```text
//! offset 0x040C
//! +-------+-------+-----+----------+-----------+-----------+
//! | major | minor | rev | reserved | reserved  | reserved  |
//! +-------+-------+-----+----------+-----------+-----------+
//! |  u8   |  u8   | u8  |    u8    |  u32 LE   |  u32 LE   |
//! +-------+-------+-----+----------+-----------+-----------+
//! ```

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, trace};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Offset of the metadata record inside the image.
pub const FW_META_OFFSET: u64 = 0x040C;

/// Size of the metadata record in bytes.
pub const FW_META_SIZE: usize = 12;

/// Version record embedded in the firmware image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FirmwareMetadata {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Revision.
    pub rev: u8,
    /// Reserved byte.
    pub reserved0: u8,
    /// Reserved word.
    pub reserved1: u32,
    /// Reserved word.
    pub reserved2: u32,
}

impl FirmwareMetadata {
    /// Read a metadata record (12 bytes).
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            major: reader.read_u8()?,
            minor: reader.read_u8()?,
            rev: reader.read_u8()?,
            reserved0: reader.read_u8()?,
            reserved1: reader.read_u32::<LittleEndian>()?,
            reserved2: reader.read_u32::<LittleEndian>()?,
        })
    }

    /// Version string in `major.minor.rev` form.
    pub fn version(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FirmwareMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.rev)
    }
}

/// Forward-only, byte-addressable firmware image.
///
/// The underlying handle is released when the image is closed or dropped.
pub struct FirmwareImage<R = BufReader<File>> {
    reader: Option<R>,
    total_len: u64,
    position: u64,
}

impl FirmwareImage<BufReader<File>> {
    /// Open an image file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Opening firmware image: {}", path.display());

        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::ImageNotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => Error::ImageReadDenied(path.to_path_buf()),
            _ => Error::ImageSource(e),
        })?;
        let total_len = file.metadata().map_err(Error::ImageSource)?.len();

        Ok(Self {
            reader: Some(BufReader::new(file)),
            total_len,
            position: 0,
        })
    }
}

impl<R: Read + Seek> FirmwareImage<R> {
    /// Wrap any seekable reader, e.g. an in-memory `Cursor`.
    pub fn from_reader(mut reader: R) -> Result<Self> {
        let total_len = reader.seek(SeekFrom::End(0)).map_err(Error::ImageSource)?;
        reader.seek(SeekFrom::Start(0)).map_err(Error::ImageSource)?;
        Ok(Self {
            reader: Some(reader),
            total_len,
            position: 0,
        })
    }

    /// Total image length in bytes.
    pub fn total_length(&self) -> u64 {
        self.total_len
    }

    /// Current read cursor.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes not yet returned by [`next_chunk`](Self::next_chunk).
    pub fn remaining(&self) -> u64 {
        self.total_len - self.position
    }

    /// Whether the image has been closed.
    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }

    fn reader_mut(&mut self) -> Result<&mut R> {
        self.reader.as_mut().ok_or_else(|| {
            Error::ImageSource(io::Error::new(
                io::ErrorKind::NotConnected,
                "firmware image closed",
            ))
        })
    }

    /// Read the version record at [`FW_META_OFFSET`].
    ///
    /// The chunk cursor is left where it was.
    pub fn read_metadata(&mut self) -> Result<FirmwareMetadata> {
        let needed = FW_META_OFFSET + FW_META_SIZE as u64;
        if self.total_len < needed {
            return Err(Error::ImageTruncated {
                needed,
                actual: self.total_len,
            });
        }

        let position = self.position;
        let reader = self.reader_mut()?;
        let meta = match reader.seek(SeekFrom::Start(FW_META_OFFSET)) {
            Ok(_) => FirmwareMetadata::read_from(reader).map_err(|e| match e {
                Error::Io(e) => Error::ImageSource(e),
                other => other,
            }),
            Err(e) => Err(Error::ImageSource(e)),
        };
        // Restore the chunk cursor whether or not the record was readable.
        reader
            .seek(SeekFrom::Start(position))
            .map_err(Error::ImageSource)?;
        let meta = meta?;

        debug!("Firmware metadata: version {meta}");
        Ok(meta)
    }

    /// Return up to `max_len` bytes from the cursor and advance it.
    ///
    /// Returns `Ok(None)` once the cursor reaches the end of the image.
    #[allow(clippy::cast_possible_truncation)] // bounded by max_len
    pub fn next_chunk(&mut self, max_len: usize) -> Result<Option<Vec<u8>>> {
        let remaining = self.remaining();
        if remaining == 0 || max_len == 0 {
            return Ok(None);
        }

        let len = remaining.min(max_len as u64) as usize;
        let mut buf = vec![0u8; len];
        self.reader_mut()?
            .read_exact(&mut buf)
            .map_err(Error::ImageSource)?;
        self.position += len as u64;

        trace!(
            "Read {len} bytes, cursor at {}/{}",
            self.position, self.total_len
        );
        Ok(Some(buf))
    }

    /// Iterate over the remaining chunks.
    pub fn chunks(&mut self, max_len: usize) -> Chunks<'_, R> {
        Chunks {
            image: self,
            max_len,
        }
    }

    /// Release the underlying handle. Later reads fail.
    pub fn close(&mut self) {
        if self.reader.take().is_some() {
            debug!("Firmware image closed");
        }
    }
}

impl<R> fmt::Debug for FirmwareImage<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("total_len", &self.total_len)
            .field("position", &self.position)
            .field("open", &self.reader.is_some())
            .finish()
    }
}

/// Iterator over image chunks, see [`FirmwareImage::chunks`].
pub struct Chunks<'a, R> {
    image: &'a mut FirmwareImage<R>,
    max_len: usize,
}

impl<R: Read + Seek> Iterator for Chunks<'_, R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.image.next_chunk(self.max_len).transpose()
    }
}
