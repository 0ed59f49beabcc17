/*
 * SPDX-FileCopyrightText: 2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::fmt;

use num_traits::PrimInt;

pub const ZEROS: [u8; 16384] = [0u8; 16384];

/// A small wrapper to format a number as a size in bytes.
#[derive(Clone, Copy)]
pub struct NumBytes<T: PrimInt>(pub T);

impl<T: PrimInt + fmt::Debug> fmt::Debug for NumBytes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == T::one() {
            write!(f, "<{:?} byte>", self.0)
        } else {
            write!(f, "<{:?} bytes>", self.0)
        }
    }
}

/// Round to the next multiple of the page size.
pub fn round_up<N: PrimInt>(offset: N, page_size: N) -> Option<N> {
    let r = offset % page_size;
    if r == N::zero() {
        Some(offset)
    } else {
        offset.checked_add(&(page_size - r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_to_page() {
        assert_eq!(round_up(0u64, 4096), Some(0));
        assert_eq!(round_up(1u64, 4096), Some(4096));
        assert_eq!(round_up(4096u64, 4096), Some(4096));
        assert_eq!(round_up(4097u64, 4096), Some(8192));
        assert_eq!(round_up(u64::MAX, 4096), None);
    }
}
