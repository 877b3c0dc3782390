use std::ops::{Deref, DerefMut};
use std::sync::{LazyLock, Mutex};

// Buffers are pooled in power-of-two size classes from 512 B to 64 KiB.
// Requests outside that range are served by plain allocations.
const MIN_SHIFT: u32 = 9;
const MAX_SHIFT: u32 = 16;
const SHELVES: usize = (MAX_SHIFT - MIN_SHIFT + 1) as usize;
// Retention bound per size class; anything freed beyond this is dropped.
const SHELF_CAP: usize = 64;

static POOL: LazyLock<BufPool> = LazyLock::new(BufPool::new);

/// Borrows a buffer of exactly `size` bytes from the global pool.
///
/// Contents are not zeroed on reuse; callers are expected to write before
/// they read. The buffer returns to the pool on drop.
pub fn get(size: usize) -> PooledBuf {
    POOL.get(size)
}

struct BufPool {
    shelves: Vec<Mutex<Vec<Vec<u8>>>>,
}

impl BufPool {
    fn new() -> Self {
        Self {
            shelves: (0..SHELVES).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    fn get(&self, size: usize) -> PooledBuf {
        let Some(shelf) = shelf_index(size) else {
            return PooledBuf {
                data: vec![0u8; size],
                len: size,
                shelf: None,
            };
        };
        let data = self.shelves[shelf].lock().unwrap().pop();
        let data = data.unwrap_or_else(|| vec![0u8; 1 << (MIN_SHIFT + shelf as u32)]);
        PooledBuf {
            data,
            len: size,
            shelf: Some(shelf),
        }
    }

    fn put(&self, shelf: usize, data: Vec<u8>) {
        let mut held = self.shelves[shelf].lock().unwrap();
        if held.len() < SHELF_CAP {
            held.push(data);
        }
    }

    #[cfg(test)]
    fn shelf_len(&self, shelf: usize) -> usize {
        self.shelves[shelf].lock().unwrap().len()
    }
}

fn shelf_index(size: usize) -> Option<usize> {
    if size == 0 || size > 1 << MAX_SHIFT {
        return None;
    }
    let shift = usize::BITS - (size - 1).max(1).leading_zeros();
    Some(shift.max(MIN_SHIFT).saturating_sub(MIN_SHIFT) as usize)
}

/// A buffer leased from the pool, usable as a plain byte slice of the
/// requested length.
pub struct PooledBuf {
    data: Vec<u8>,
    len: usize,
    shelf: Option<usize>,
}

impl Deref for PooledBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(shelf) = self.shelf {
            let data = std::mem::take(&mut self.data);
            // Only full-size class buffers go back on the shelf.
            if data.len() == 1 << (MIN_SHIFT + shelf as u32) {
                POOL.put(shelf, data);
            }
        }
    }
}
