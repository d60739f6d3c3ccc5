use std::ops::Range;

use crate::error::{Result, UploadError};

const MEGABYTE: u64 = 1024 * 1024; // 1MB
pub const DEFAULT_PART_SIZE: u64 = 5 * MEGABYTE;
/// Smallest part the object store accepts for every part but the last.
pub const MIN_PART_SIZE: u64 = 5 * MEGABYTE;
pub const MAX_PART_SIZE: u64 = 5 * 1024 * MEGABYTE;
pub const MAX_PARTS: u64 = 10000;

/// One contiguous slice of the source, uploaded independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartDescriptor {
    /// 1-based.
    pub part_number: u32,
    pub range: Range<u64>,
}

impl PartDescriptor {
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

pub fn part_count(file_size: u64, part_size: u64) -> u64 {
    file_size.div_ceil(part_size)
}

/// Splits `file_size` bytes into parts of `part_size`; the last part may be shorter.
pub fn plan_parts(file_size: u64, part_size: u64) -> Result<Vec<PartDescriptor>> {
    if file_size == 0 {
        return Err(UploadError::Validation(
            "cannot upload an empty file".to_string(),
        ));
    }
    if part_size == 0 {
        return Err(UploadError::Validation(
            "part size must be greater than zero".to_string(),
        ));
    }

    let total_parts = part_count(file_size, part_size);
    if total_parts > MAX_PARTS {
        return Err(UploadError::Validation(format!(
            "file size ({} bytes) needs {} parts of {} bytes, more than the limit of {}",
            file_size, total_parts, part_size, MAX_PARTS
        )));
    }

    Ok((0..total_parts)
        .map(|index| {
            let start = index * part_size;
            let end = start.saturating_add(part_size).min(file_size);
            PartDescriptor {
                part_number: (index + 1) as u32,
                range: start..end,
            }
        })
        .collect())
}

/// Grows `preferred` until `file_size` fits in at most [`MAX_PARTS`] parts.
///
/// Never returns less than [`MIN_PART_SIZE`].
pub fn fit_part_size(file_size: u64, preferred: u64) -> Result<u64> {
    let mut part_size = preferred.max(MIN_PART_SIZE);

    if part_count(file_size, part_size) > MAX_PARTS {
        part_size = file_size.div_ceil(MAX_PARTS);

        if part_size > MAX_PART_SIZE {
            let max_file_size = MAX_PART_SIZE * MAX_PARTS;
            return Err(UploadError::Validation(format!(
                "file size ({} bytes) exceeds maximum uploadable size ({} bytes = {} parts * {} bytes)",
                file_size, max_file_size, MAX_PARTS, MAX_PART_SIZE
            )));
        }
    }

    Ok(part_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_parts_covers_file() {
        for (file_size, part_size) in [(1, 1), (7, 3), (9, 3), (10, 4), (1, 100), (12345, 1000)] {
            let parts = plan_parts(file_size, part_size).unwrap();
            assert_eq!(parts.len() as u64, file_size.div_ceil(part_size));

            let mut cursor = 0;
            for (i, part) in parts.iter().enumerate() {
                assert_eq!(part.part_number as usize, i + 1);
                assert_eq!(part.range.start, cursor);
                assert!(part.len() <= part_size);
                assert!(!part.is_empty());
                cursor = part.range.end;
            }
            assert_eq!(cursor, file_size);
        }
    }

    #[test]
    fn test_plan_parts_twelve_mib() {
        let parts = plan_parts(12 * MEGABYTE, 5 * MEGABYTE).unwrap();
        let ranges: Vec<_> = parts.iter().map(|p| p.range.clone()).collect();
        assert_eq!(
            ranges,
            vec![
                0..5 * MEGABYTE,
                5 * MEGABYTE..10 * MEGABYTE,
                10 * MEGABYTE..12 * MEGABYTE
            ]
        );
    }

    #[test]
    fn test_plan_parts_exact_multiple() {
        let parts = plan_parts(5 * MEGABYTE, 5 * MEGABYTE).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].len(), 5 * MEGABYTE);
    }

    #[test]
    fn test_plan_parts_rejects_empty_file() {
        assert!(matches!(
            plan_parts(0, DEFAULT_PART_SIZE),
            Err(UploadError::Validation(_))
        ));
    }

    #[test]
    fn test_plan_parts_rejects_zero_part_size() {
        assert!(matches!(plan_parts(10, 0), Err(UploadError::Validation(_))));
    }

    #[test]
    fn test_plan_parts_rejects_too_many_parts() {
        assert!(matches!(
            plan_parts(MAX_PARTS + 1, 1),
            Err(UploadError::Validation(_))
        ));
        assert_eq!(plan_parts(MAX_PARTS, 1).unwrap().len() as u64, MAX_PARTS);
    }

    #[test]
    fn test_plan_parts_near_u64_max() {
        let parts = plan_parts(u64::MAX, u64::MAX - 1).unwrap();
        assert_eq!(
            parts.iter().map(|p| p.range.clone()).collect::<Vec<_>>(),
            vec![0..u64::MAX - 1, u64::MAX - 1..u64::MAX]
        );

        let parts = plan_parts(u64::MAX, u64::MAX).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].range, 0..u64::MAX);
    }

    #[test]
    fn test_fit_part_size() {
        assert_eq!(fit_part_size(MEGABYTE, 1).unwrap(), MIN_PART_SIZE);
        assert_eq!(fit_part_size(100 * MEGABYTE, 8 * MEGABYTE).unwrap(), 8 * MEGABYTE);

        let huge = 100 * 1024 * MEGABYTE;
        let part_size = fit_part_size(huge, DEFAULT_PART_SIZE).unwrap();
        assert!(part_count(huge, part_size) <= MAX_PARTS);

        assert!(fit_part_size(MAX_PART_SIZE * MAX_PARTS + 1, DEFAULT_PART_SIZE).is_err());
    }
}
