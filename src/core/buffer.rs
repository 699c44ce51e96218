//! Two-slot state arena.
//!
//! Every kernel reads the back slot of its inputs and writes the front slot of
//! its output. [`DoubleBuffer::swap`] publishes the freshly written front as
//! the new back, so a reader never observes a half-written surface.

use ndarray::{Array, Dimension, ShapeBuilder};
use serde::{Deserialize, Serialize};

use super::{check_stored, NeoError, NeoResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DoubleBuffer<T> {
    slots: [T; 2],
    front: usize,
    swaps: u64,
}

impl<T: Clone> DoubleBuffer<T> {
    /// Both slots start as copies of `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            slots: [initial.clone(), initial],
            front: 0,
            swaps: 0,
        }
    }
}

impl<T> DoubleBuffer<T> {
    /// The newest completed state.
    pub fn read(&self) -> &T {
        &self.slots[1 - self.front]
    }

    /// The slot the next launch writes into.
    pub fn write_target(&mut self) -> &mut T {
        &mut self.slots[self.front]
    }

    /// The state that was current before the most recent swap. Only valid
    /// until the next write into the front slot.
    pub fn previous(&self) -> &T {
        &self.slots[self.front]
    }

    /// Borrow back (read-only) and front (writable) at the same time, for
    /// kernels that update a surface from its own previous value.
    pub fn split(&mut self) -> (&T, &mut T) {
        let [a, b] = &mut self.slots;
        if self.front == 0 {
            (&*b, a)
        } else {
            (&*a, b)
        }
    }

    /// Direct access to the back slot, for fills that happen outside a
    /// launch (clears at the start of an activation pass).
    pub fn read_mut(&mut self) -> &mut T {
        &mut self.slots[1 - self.front]
    }

    pub fn swap(&mut self) {
        self.front = 1 - self.front;
        self.swaps += 1;
    }

    /// Total number of swaps since construction.
    pub fn swaps(&self) -> u64 {
        self.swaps
    }

    /// Index of the slot currently holding the back state.
    pub fn back_index(&self) -> usize {
        1 - self.front
    }

    /// Whether the front index names one of the two slots. Always true for
    /// buffers built in process; a deserialized buffer may violate it.
    pub fn is_well_formed(&self) -> bool {
        self.front < 2
    }
}

impl<D: Dimension> DoubleBuffer<Array<f32, D>> {
    /// Double buffer of zero-filled arrays.
    pub fn zeros<Sh: ShapeBuilder<Dim = D>>(shape: Sh) -> Self {
        Self::new(Array::zeros(shape))
    }

    /// Fill the back slot with `value`.
    pub fn fill_back(&mut self, value: f32) {
        self.read_mut().fill(value);
    }

    /// Check a restored buffer: a valid front index and both slots of
    /// `shape`.
    pub fn check_layout(&self, what: &str, shape: &[usize]) -> NeoResult<()> {
        if !self.is_well_formed() {
            return Err(NeoError::Checkpoint(format!(
                "{what} has front index {}, expected 0 or 1",
                self.front
            )));
        }
        for slot in &self.slots {
            check_stored(what, slot.shape(), shape)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_read_returns_last_completed_write() {
        let mut db = DoubleBuffer::<Array2<f32>>::zeros((2, 2));
        for n in 1..=7 {
            db.write_target().fill(n as f32);
            db.swap();
            assert!(db.read().iter().all(|&v| v == n as f32));
        }
    }

    #[test]
    fn test_swap_parity_matches_call_count() {
        let mut db = DoubleBuffer::new(0u8);
        let start = db.back_index();
        for n in 0..9u64 {
            assert_eq!(db.swaps(), n);
            assert_eq!(db.back_index() == start, n % 2 == 0);
            db.swap();
        }
    }

    #[test]
    fn test_restored_front_index_is_checked() {
        let db = DoubleBuffer::<Array2<f32>>::zeros((2, 3));
        let json = serde_json::to_string(&db).unwrap();
        let restored: DoubleBuffer<Array2<f32>> = serde_json::from_str(&json).unwrap();
        assert!(restored.check_layout("surface", &[2, 3]).is_ok());
        assert!(matches!(
            restored.check_layout("surface", &[3, 2]),
            Err(NeoError::Checkpoint(_))
        ));

        let tampered: DoubleBuffer<Array2<f32>> =
            serde_json::from_str(&json.replacen("\"front\":0", "\"front\":2", 1)).unwrap();
        assert!(!tampered.is_well_formed());
        assert!(matches!(
            tampered.check_layout("surface", &[2, 3]),
            Err(NeoError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_split_reads_back_writes_front() {
        let mut db = DoubleBuffer::new(1);
        *db.write_target() = 5;
        db.swap();
        {
            let (back, front) = db.split();
            assert_eq!(*back, 5);
            *front = *back + 1;
        }
        assert_eq!(*db.read(), 5);
        db.swap();
        assert_eq!(*db.read(), 6);
        assert_eq!(*db.previous(), 5);
    }
}
