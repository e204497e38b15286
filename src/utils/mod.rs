//! Various utilities functions and types

use std::{os::unix::io::AsFd, path::PathBuf};

/// Trait representing open devices that *may* return a `Path`
pub trait DevPath {
    /// Returns the path of the open device if possible
    fn dev_path(&self) -> Option<PathBuf>;
}

impl<A: AsFd> DevPath for A {
    fn dev_path(&self) -> Option<PathBuf> {
        use std::{fs, os::unix::io::AsRawFd};

        fs::read_link(format!("/proc/self/fd/{:?}", self.as_fd().as_raw_fd())).ok()
    }
}

/// Rounds `value` up to the next multiple of `align`.
///
/// `align` has to be a non-zero power of two. Returns `None` on overflow.
pub(crate) const fn align_up(value: u32, align: u32) -> Option<u32> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::align_up;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(100, 64), Some(128));
        assert_eq!(align_up(128, 64), Some(128));
        assert_eq!(align_up(0, 64), Some(0));
        assert_eq!(align_up(1, 1), Some(1));
    }

    #[test]
    fn align_up_overflow() {
        assert_eq!(align_up(u32::MAX, 64), None);
    }
}
