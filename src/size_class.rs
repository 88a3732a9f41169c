//! Size-class rounding and bucket mapping.
//!
//! Requests up to 256 KiB land in one of 208 classes spread over five
//! alignment ranges:
//!
//! | request bytes     | alignment | bucket indices |
//! |-------------------|-----------|----------------|
//! | [1, 128]          | 8         | [0, 16)        |
//! | (128, 1024]       | 16        | [16, 72)       |
//! | (1024, 8 KiB]     | 128       | [72, 128)      |
//! | (8 KiB, 64 KiB]   | 1024      | [128, 184)     |
//! | (64 KiB, 256 KiB] | 8 KiB     | [184, 208)     |
//!
//! `round_up` and `class_index` are exact inverses: every byte count maps
//! to one bucket, and the bucket's size is the smallest member of its
//! range that covers the request.

use crate::config::{FETCH_MAX, FETCH_MIN, MAX_SMALL_SIZE, PAGE_SHIFT, PAGE_SIZE};

/// Number of size-class buckets.
pub const NUM_SIZE_CLASSES: usize = 208;

/// Free-list bucket counts of the first four ranges, used as index offsets.
const GROUP: [usize; 4] = [16, 56, 56, 56];

const _: () = assert!(GROUP[0] + GROUP[1] + GROUP[2] + GROUP[3] + 24 == NUM_SIZE_CLASSES);

#[inline]
const fn round_up_to(bytes: usize, align: usize) -> usize {
    (bytes + align - 1) & !(align - 1)
}

// Bucket index within one range, given the alignment as a power of two.
#[inline]
const fn range_index(bytes: usize, align_shift: usize) -> usize {
    ((bytes + (1 << align_shift) - 1) >> align_shift) - 1
}

/// Round a request up to its allocation size.
///
/// Requests beyond [`MAX_SMALL_SIZE`] round up to whole pages.
#[inline]
pub fn round_up(bytes: usize) -> usize {
    assert!(bytes > 0);
    if bytes <= 128 {
        round_up_to(bytes, 8)
    } else if bytes <= 1024 {
        round_up_to(bytes, 16)
    } else if bytes <= 8 * 1024 {
        round_up_to(bytes, 128)
    } else if bytes <= 64 * 1024 {
        round_up_to(bytes, 1024)
    } else if bytes <= MAX_SMALL_SIZE {
        round_up_to(bytes, 8 * 1024)
    } else {
        round_up_to(bytes, PAGE_SIZE)
    }
}

/// Map a request to its bucket index in `0..NUM_SIZE_CLASSES`.
///
/// The request must not exceed [`MAX_SMALL_SIZE`]; larger allocations never
/// reach the size-class tiers.
#[inline]
pub fn class_index(bytes: usize) -> usize {
    assert!(bytes > 0 && bytes <= MAX_SMALL_SIZE);
    if bytes <= 128 {
        range_index(bytes, 3)
    } else if bytes <= 1024 {
        range_index(bytes - 128, 4) + GROUP[0]
    } else if bytes <= 8 * 1024 {
        range_index(bytes - 1024, 7) + GROUP[0] + GROUP[1]
    } else if bytes <= 64 * 1024 {
        range_index(bytes - 8 * 1024, 10) + GROUP[0] + GROUP[1] + GROUP[2]
    } else {
        range_index(bytes - 64 * 1024, 13) + GROUP[0] + GROUP[1] + GROUP[2] + GROUP[3]
    }
}

/// How many objects of `size` bytes to move per thread-cache/central-cache
/// transfer: small objects batch more, large ones less.
#[inline]
pub fn num_move_objects(size: usize) -> usize {
    assert!(size > 0);
    (MAX_SMALL_SIZE / size).clamp(FETCH_MIN, FETCH_MAX)
}

/// How many pages the central cache requests per span for objects of
/// `size` bytes: one full transfer batch, and at least one page.
#[inline]
pub fn num_move_pages(size: usize) -> usize {
    let npages = (num_move_objects(size) * size) >> PAGE_SHIFT;
    if npages == 0 { 1 } else { npages }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up_covers_request() {
        for bytes in 1..=MAX_SMALL_SIZE {
            let rounded = round_up(bytes);
            assert!(rounded >= bytes, "round_up({bytes}) = {rounded} shrank");
            assert_eq!(rounded % 8, 0, "round_up({bytes}) = {rounded} not 8-aligned");
        }
    }

    #[test]
    fn test_index_stable_under_rounding() {
        for bytes in 1..=MAX_SMALL_SIZE {
            let idx = class_index(bytes);
            let rounded = round_up(bytes);
            assert!(idx < NUM_SIZE_CLASSES);
            assert_eq!(
                class_index(rounded),
                idx,
                "index({bytes}) != index(round_up({bytes}) = {rounded})"
            );
            // The rounded size is the smallest member of its class.
            if rounded > 8 {
                assert!(class_index(rounded - 8) <= idx);
                assert_ne!(round_up(rounded - 1), rounded - 1);
            }
        }
    }

    #[test]
    fn test_range_boundaries() {
        assert_eq!(class_index(1), 0);
        assert_eq!(class_index(8), 0);
        assert_eq!(class_index(128), 15);
        assert_eq!(class_index(129), 16);
        assert_eq!(class_index(1024), 71);
        assert_eq!(class_index(1025), 72);
        assert_eq!(class_index(8 * 1024), 127);
        assert_eq!(class_index(8 * 1024 + 1), 128);
        assert_eq!(class_index(64 * 1024), 183);
        assert_eq!(class_index(64 * 1024 + 1), 184);
        assert_eq!(class_index(MAX_SMALL_SIZE), NUM_SIZE_CLASSES - 1);
    }

    #[test]
    fn test_round_up_exact_sizes() {
        assert_eq!(round_up(1), 8);
        assert_eq!(round_up(8), 8);
        assert_eq!(round_up(9), 16);
        assert_eq!(round_up(128), 128);
        assert_eq!(round_up(129), 144);
        assert_eq!(round_up(1024), 1024);
        assert_eq!(round_up(1025), 1152);
        assert_eq!(round_up(8 * 1024 + 1), 9 * 1024);
        assert_eq!(round_up(64 * 1024 + 1), 72 * 1024);
        assert_eq!(round_up(MAX_SMALL_SIZE), MAX_SMALL_SIZE);
    }

    #[test]
    fn test_round_up_beyond_classes_is_page_granular() {
        assert_eq!(round_up(MAX_SMALL_SIZE + 1), MAX_SMALL_SIZE + PAGE_SIZE);
        assert_eq!(round_up(10 * PAGE_SIZE), 10 * PAGE_SIZE);
        assert_eq!(round_up(10 * PAGE_SIZE + 1), 11 * PAGE_SIZE);
    }

    #[test]
    fn test_num_move_objects_clamped() {
        assert_eq!(num_move_objects(8), FETCH_MAX);
        assert_eq!(num_move_objects(MAX_SMALL_SIZE), FETCH_MIN);
        for size in [8, 16, 64, 1024, 8192, MAX_SMALL_SIZE] {
            let n = num_move_objects(size);
            assert!((FETCH_MIN..=FETCH_MAX).contains(&n));
        }
    }

    #[test]
    fn test_num_move_pages_minimum_one() {
        assert!(num_move_pages(8) >= 1);
        // A full batch of the largest class spans MAX_PAGES pages.
        assert_eq!(
            num_move_pages(MAX_SMALL_SIZE),
            (FETCH_MIN * MAX_SMALL_SIZE) >> PAGE_SHIFT
        );
    }
}
