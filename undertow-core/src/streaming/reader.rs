//! Positioned `Read + Seek` cursor over one file of open content.

use std::io::{self, Read, Seek, SeekFrom};

use tokio_util::sync::CancellationToken;

use crate::UndertowError;
use crate::content::ContentHandle;

/// Cursor over a single file, for hosts that expect `std::io` streams.
///
/// Every `read` blocks like [`ContentHandle::read`]. Failures come back as
/// `io::Error` wrapping the [`UndertowError`], so cancellation can be told
/// apart with [`ContentReader::is_cancellation`].
pub struct ContentReader {
    handle: ContentHandle,
    file_index: usize,
    position: u64,
    size: u64,
    cancel: CancellationToken,
}

impl ContentReader {
    /// # Errors
    /// - `UndertowError::FileNotFound` - Index out of range
    pub fn new(
        handle: ContentHandle,
        file_index: usize,
        cancel: CancellationToken,
    ) -> Result<Self, UndertowError> {
        let size = handle.file_size(file_index)?;
        Ok(Self {
            handle,
            file_index,
            position: 0,
            size,
            cancel,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn file_index(&self) -> usize {
        self.file_index
    }

    pub fn handle(&self) -> &ContentHandle {
        &self.handle
    }

    /// True when `error` came from a cancelled read.
    pub fn is_cancellation(error: &io::Error) -> bool {
        error
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<UndertowError>())
            .is_some_and(UndertowError::is_cancelled)
    }
}

impl Read for ContentReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.size {
            return Ok(0);
        }

        let read = self
            .handle
            .read(self.file_index, self.position as i64, buf, &self.cancel)
            .map_err(io::Error::other)?;
        self.position += read as u64;
        Ok(read)
    }
}

impl Seek for ContentReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };

        let target = target.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )
        })?;
        self.position = target;
        Ok(target)
    }
}
