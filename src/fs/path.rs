//! Path names and their elements.

use core::cmp;

use cstr_core::CStr;

use super::DIRSIZ;

/// One path element: a directory-entry name. Holds at most DIRSIZ - 1
/// bytes; the last byte of an on-disk entry is the NUL terminator.
#[derive(PartialEq, Debug)]
#[repr(transparent)]
pub struct FileName {
    // Invariant:
    // - The slice contains no NUL characters.
    // - The slice is not longer than DIRSIZ - 1.
    inner: [u8],
}

impl FileName {
    /// Truncate bytes after the first DIRSIZ - 1 bytes.
    ///
    /// # Safety
    ///
    /// `bytes` must not contain any NUL characters.
    pub unsafe fn from_bytes(bytes: &[u8]) -> &Self {
        debug_assert!(!bytes.contains(&0));
        // SAFETY: `&FileName` is layout-compatible with `[u8]` because of
        // repr(transparent), and the truncated slice satisfies both
        // invariants.
        unsafe { &*(&bytes[..cmp::min(DIRSIZ - 1, bytes.len())] as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
}

/// A `/`-delimited path.
#[repr(transparent)]
pub struct Path {
    // Invariant: the slice contains no NUL characters.
    inner: [u8],
}

impl Path {
    pub fn new(cstr: &CStr) -> &Self {
        // SAFETY: layout-compatible by repr(transparent), and
        // CStr::to_bytes contains no NUL.
        unsafe { &*(cstr.to_bytes() as *const [u8] as *const Self) }
    }

    /// # Safety
    ///
    /// `bytes` must not contain any NUL bytes.
    pub unsafe fn from_bytes(bytes: &[u8]) -> &Self {
        // SAFETY: layout-compatible by repr(transparent); the safety
        // condition provides the invariant.
        unsafe { &*(bytes as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    /// Returns `true` if the path begins with `/`.
    pub fn is_absolute(&self) -> bool {
        !self.inner.is_empty() && self.inner[0] == b'/'
    }

    pub fn is_empty_string(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns `Some((remainder, name))` where `name` is the next path
    /// element and `remainder` is the rest, with no leading slashes (so the
    /// caller can check `is_empty_string` to see whether the name is the
    /// last element). Returns `None` if there is no element to remove.
    ///
    /// Examples:
    ///   skipelem("a/bb/c") = Some(("bb/c", "a"))
    ///   skipelem("///a//bb") = Some(("bb", "a"))
    ///   skipelem("a") = Some(("", "a"))
    ///   skipelem("") = None
    ///   skipelem("////") = None
    pub fn skipelem(&self) -> Option<(&Self, &FileName)> {
        let mut bytes = &self.inner;

        let name_start = bytes.iter().position(|ch| *ch != b'/')?;
        bytes = &bytes[name_start..];

        let len = bytes
            .iter()
            .position(|ch| *ch == b'/')
            .unwrap_or_else(|| bytes.len());

        // SAFETY: a subslice of self.inner, which contains no NUL.
        let name = unsafe { FileName::from_bytes(&bytes[..len]) };

        bytes = &bytes[len..];

        let next_start = bytes
            .iter()
            .position(|ch| *ch != b'/')
            .unwrap_or_else(|| bytes.len());

        // SAFETY: a subslice of self.inner, which contains no NUL.
        let path = unsafe { Self::from_bytes(&bytes[next_start..]) };
        Some((path, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skip(path: &[u8]) -> Option<(&[u8], &[u8])> {
        // SAFETY: test inputs contain no NUL.
        let path = unsafe { Path::from_bytes(path) };
        path.skipelem()
            .map(|(rest, name)| (rest.as_bytes(), name.as_bytes()))
    }

    #[test]
    fn splits_off_the_first_element() {
        assert_eq!(skip(b"a/bb/c"), Some((&b"bb/c"[..], &b"a"[..])));
        assert_eq!(skip(b"a"), Some((&b""[..], &b"a"[..])));
    }

    #[test]
    fn collapses_repeated_slashes() {
        assert_eq!(skip(b"///a//bb"), Some((&b"bb"[..], &b"a"[..])));
        assert_eq!(skip(b"a////"), Some((&b""[..], &b"a"[..])));
    }

    #[test]
    fn empty_paths_have_no_elements() {
        assert_eq!(skip(b""), None);
        assert_eq!(skip(b"////"), None);
    }

    #[test]
    fn long_names_leave_room_for_the_terminator() {
        let (_, name) = skip(b"abcdefghijklmnopqrs/x").unwrap();
        assert_eq!(name.len(), DIRSIZ - 1);
        assert_eq!(name, &b"abcdefghijklmnopqrs"[..DIRSIZ - 1]);
    }

    #[test]
    fn absolute_and_relative_paths() {
        // SAFETY: no NUL bytes.
        unsafe {
            assert!(Path::from_bytes(b"/a/b").is_absolute());
            assert!(!Path::from_bytes(b"a/b").is_absolute());
            assert!(!Path::from_bytes(b"").is_absolute());
        }
    }
}
