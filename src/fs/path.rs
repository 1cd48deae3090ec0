//! Path strings and component names.
//!
//! A path is a byte string of components separated by `/`. A leading `/`
//! makes it absolute; repeated separators are collapsed. Each component is at
//! most `NAME_MAX` bytes.

use core::fmt;

use arrayvec::ArrayVec;

use crate::error::{FsError, Result};
use crate::param::NAME_MAX;

/// Name of the self link every directory carries.
pub const SELF_NAME: &[u8] = b".";

/// Name of the parent link every directory carries.
pub const PARENT_NAME: &[u8] = b"..";

/// A single path component: 1 to `NAME_MAX` bytes, no `/`, no NUL.
#[derive(Clone, PartialEq, Eq)]
pub struct FileName {
    bytes: ArrayVec<u8, NAME_MAX>,
}

impl FileName {
    /// Validates `bytes` as a component name.
    pub fn new(bytes: &[u8]) -> Result<FileName> {
        if bytes.is_empty() || bytes.contains(&b'/') || bytes.contains(&0) {
            return Err(FsError::InvalidPath);
        }
        let mut name = ArrayVec::new();
        name.try_extend_from_slice(bytes)
            .map_err(|_| FsError::NameTooLong)?;
        Ok(FileName { bytes: name })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Is this the `.` self link?
    pub fn is_self(&self) -> bool {
        self.as_bytes() == SELF_NAME
    }

    /// Is this the `..` parent link?
    pub fn is_parent(&self) -> bool {
        self.as_bytes() == PARENT_NAME
    }
}

impl fmt::Debug for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.bytes))
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
}

/// A borrowed path, consumed one component at a time by [`Path::next_part`].
#[derive(Clone, Copy)]
pub struct Path<'s> {
    inner: &'s [u8],
}

impl<'s> Path<'s> {
    pub fn new(path: &'s str) -> Path<'s> {
        Path {
            inner: path.as_bytes(),
        }
    }

    /// Returns `true` if the path begins with `/`.
    pub fn is_absolute(&self) -> bool {
        self.inner.first() == Some(&b'/')
    }

    /// Returns `true` if no component remains to be consumed.
    pub fn is_exhausted(&self) -> bool {
        self.inner.iter().all(|&ch| ch == b'/')
    }

    /// Splits off the next component.
    ///
    /// Returns `Ok(None)` once the path is exhausted, and
    /// `Err(FsError::NameTooLong)` if the next component exceeds `NAME_MAX`
    /// bytes.
    pub fn next_part(&mut self) -> Result<Option<FileName>> {
        let start = self
            .inner
            .iter()
            .position(|&ch| ch != b'/')
            .unwrap_or(self.inner.len());
        self.inner = &self.inner[start..];
        if self.inner.is_empty() {
            return Ok(None);
        }

        let len = self
            .inner
            .iter()
            .position(|&ch| ch == b'/')
            .unwrap_or(self.inner.len());
        let name = FileName::new(&self.inner[..len])?;
        self.inner = &self.inner[len..];
        Ok(Some(name))
    }
}

/// Extracts the final component of `path`: the name `create`, `open` and
/// `remove` operate on. Fails if any component is too long, or if the path
/// names no component at all.
pub fn filename_of(path: &str) -> Result<FileName> {
    let mut path = Path::new(path);
    let mut last = None;
    while let Some(name) = path.next_part()? {
        last = Some(name);
    }
    last.ok_or(FsError::InvalidPath)
}
