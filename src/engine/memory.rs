// Out-of-core Step Store
use bitvec::prelude::*;
use memmap2::{MmapMut, MmapOptions};
use ndarray::{s, ArrayView2};
use rayon::prelude::*;
use std::fs::File;
use std::ops::Range;
use std::path::Path;

use crate::engine::chunked::ChunkSpec;
use crate::engine::rng::StepGenerator;
use crate::error::{Result, WalkError};

/// page size typically 4KB, usually defined by system but hardcoded here
const PAGE_SIZE: usize = 4096;
const ELEMENT_BYTES: usize = std::mem::size_of::<f64>();

/// Step array kept in a memory-mapped file instead of the heap.
/// Resources are tied to this struct's lifetime.
pub struct MappedSteps {
    mapping: MmapMut,
    _file: File, // Keep file handle open
    realisations: usize,
    steps: usize,
    len: usize,            // realisations * steps, checked at creation
    resident_rows: BitVec, // Rows currently expected in DRAM
}

/// Element count and byte size of a (realisations x steps) f64 array,
/// or None when either overflows `usize`.
pub fn store_size(realisations: usize, steps: usize) -> Option<(usize, usize)> {
    let len = realisations.checked_mul(steps)?;
    let bytes = len.checked_mul(ELEMENT_BYTES)?;
    Some((len, bytes))
}

impl MappedSteps {
    /// Create (or truncate) a backing file sized for `realisations x steps` f64 values
    pub fn create(path: impl AsRef<Path>, realisations: usize, steps: usize) -> Result<Self> {
        let (len, total_bytes) = store_size(realisations, steps).ok_or_else(|| {
            WalkError::InvalidConfig(format!(
                "step store of {realisations} x {steps} f64 values overflows the address space"
            ))
        })?;
        if total_bytes == 0 {
            return Err(WalkError::InvalidConfig(
                "mapped step store needs at least one element".into(),
            ));
        }

        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        // Pre-allocate disk space (prevent fragmentation)
        file.set_len(total_bytes as u64)?;
        // Safety: We assume we have exclusive access to this file while it is mapped
        let mapping = unsafe { MmapOptions::new().map_mut(&file)? };
        // Advise OS: chunks are consumed front to back
        unsafe {
            libc::madvise(
                mapping.as_ptr() as *mut _,
                total_bytes,
                libc::MADV_SEQUENTIAL,
            );
        }

        Ok(Self {
            mapping,
            _file: file,
            realisations,
            steps,
            len,
            resident_rows: bitvec![0; realisations],
        })
    }

    pub fn dim(&self) -> (usize, usize) {
        (self.realisations, self.steps)
    }

    fn as_slice(&self) -> &[f64] {
        // mmap is page aligned, which satisfies f64 alignment
        unsafe {
            std::slice::from_raw_parts(
                self.mapping.as_ptr() as *const f64,
                self.len,
            )
        }
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.mapping.as_mut_ptr() as *mut f64,
                self.len,
            )
        }
    }

    /// Fill every row with fresh normal steps
    pub fn fill_from(&mut self, generator: &mut StepGenerator) -> Result<()> {
        generator.fill_normal(self.as_mut_slice());
        self.mapping.flush()?;
        self.resident_rows.fill(true);
        Ok(())
    }

    /// Fill each `chunk_rows` block from its own stream, in parallel.
    /// Same values as [`StepGenerator::chunked_steps`] with the same arguments.
    pub fn fill_chunked(&mut self, seed: u64, chunk_rows: usize) -> Result<()> {
        let spec = ChunkSpec::new(self.realisations, chunk_rows)?;
        let block = spec.chunk_rows().min(self.realisations) * self.steps;
        self.as_mut_slice()
            .par_chunks_mut(block)
            .enumerate()
            .for_each(|(index, values)| StepGenerator::for_chunk(seed, index).fill_normal(values));
        self.mapping.flush()?;
        self.resident_rows.fill(true);
        Ok(())
    }

    pub fn view(&self) -> Result<ArrayView2<'_, f64>> {
        Ok(ArrayView2::from_shape(
            (self.realisations, self.steps),
            self.as_slice(),
        )?)
    }

    pub fn rows(&self, rows: Range<usize>) -> Result<ArrayView2<'_, f64>> {
        self.check_rows(&rows)?;
        Ok(self.view()?.slice_move(s![rows, ..]))
    }

    /// Write the rows back and let the OS drop their pages (Eviction).
    /// Later reads fault them back in from the file.
    pub fn release_rows(&mut self, rows: Range<usize>) -> Result<()> {
        self.check_rows(&rows)?;
        let row_bytes = self.steps * ELEMENT_BYTES;
        let offset = rows.start * row_bytes;
        let len = rows.len() * row_bytes;
        if len == 0 {
            return Ok(());
        }
        self.mapping.flush_range(offset, len)?;

        // Only whole pages inside the range are advised away
        let first_page = offset.div_ceil(PAGE_SIZE);
        let end_page = (offset + len) / PAGE_SIZE;
        if end_page > first_page {
            unsafe {
                libc::madvise(
                    self.mapping.as_ptr().add(first_page * PAGE_SIZE) as *mut _,
                    (end_page - first_page) * PAGE_SIZE,
                    libc::MADV_DONTNEED, // Aggressively free RAM
                );
            }
        }

        self.resident_rows[rows].fill(false);
        Ok(())
    }

    pub fn is_resident(&self, row: usize) -> bool {
        self.resident_rows.get(row).is_some_and(|bit| *bit)
    }

    pub fn resident_count(&self) -> usize {
        self.resident_rows.count_ones()
    }

    fn check_rows(&self, rows: &Range<usize>) -> Result<()> {
        if rows.start > rows.end || rows.end > self.realisations {
            return Err(WalkError::InvalidConfig(format!(
                "row range {}..{} outside 0..{}",
                rows.start, rows.end, self.realisations
            )));
        }
        Ok(())
    }
}

impl Drop for MappedSteps {
    fn drop(&mut self) {
        // Ensure data hits the disk before we close
        let _ = self.mapping.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_mapped_store_matches_generator() {
        let dir = tempdir().unwrap();
        let mut store = MappedSteps::create(dir.path().join("steps.bin"), 6, 700).unwrap();
        store.fill_from(&mut StepGenerator::from_seed(9)).unwrap();

        let mut expected = vec![0.0; 6 * 700];
        StepGenerator::from_seed(9).fill_normal(&mut expected);
        assert_eq!(store.view().unwrap().as_slice().unwrap(), expected.as_slice());
        assert_eq!(store.resident_count(), 6);
    }

    #[test]
    fn test_release_keeps_contents() {
        let dir = tempdir().unwrap();
        let mut store = MappedSteps::create(dir.path().join("steps.bin"), 8, 1024).unwrap();
        store.fill_from(&mut StepGenerator::from_seed(1)).unwrap();
        let before = store.rows(2..5).unwrap().to_owned();

        store.release_rows(2..5).unwrap();
        assert!(!store.is_resident(3));
        assert!(store.is_resident(5));
        assert_eq!(store.resident_count(), 5);
        assert_eq!(store.rows(2..5).unwrap(), before);
    }

    #[test]
    fn test_bad_ranges_and_sizes() {
        let dir = tempdir().unwrap();
        assert!(MappedSteps::create(dir.path().join("empty.bin"), 0, 10).is_err());
        let store = MappedSteps::create(dir.path().join("steps.bin"), 2, 2).unwrap();
        assert!(store.rows(1..3).is_err());
    }

    #[test]
    fn test_chunked_fill_matches_chunked_generation() {
        let dir = tempdir().unwrap();
        let mut store = MappedSteps::create(dir.path().join("steps.bin"), 11, 9).unwrap();
        store.fill_chunked(5, 4).unwrap();

        let expected = StepGenerator::chunked_steps(5, 11, 9, 4).unwrap();
        assert_eq!(store.view().unwrap(), expected);
        assert_eq!(store.resident_count(), 11);
        assert!(store.fill_chunked(5, 0).is_err());
    }

    #[test]
    fn test_oversized_store_rejected_before_mapping() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("huge.bin");
        // (2^61 + 1) * 8 bytes wraps to 8 without the checked product
        let result = MappedSteps::create(&path, (1 << 61) + 1, 1);
        assert!(matches!(result, Err(WalkError::InvalidConfig(_))));
        assert!(!path.exists());

        assert_eq!(store_size(usize::MAX, 2), None);
        assert_eq!(store_size(3, 4), Some((12, 96)));
    }
}
