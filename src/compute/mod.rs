//! In-order compute queue.
//!
//! Every heavy operation of the engine is a data-parallel launch over a 2D
//! index range (hidden or visible grid) or over the per-unit weight lanes of
//! a 3D weight tensor. [`ComputeContext`] is the single queue those launches
//! go through. The CPU reference backend executes each launch to completion
//! before returning, distributing the index range over the Rayon pool, so
//! enqueue order is execution order.
//!
//! A launch borrows its inputs shared and its output exclusively. Combined
//! with [`DoubleBuffer`](crate::core::DoubleBuffer) this makes it impossible
//! for a kernel to read the slot it is writing.
//!
//! The per-item arithmetic lives in [`kernels`] as plain functions of
//! (input views, scalar parameters) so the scheduling discipline stays
//! separate from the learning rules.

pub mod kernels;

use ndarray::{Array2, Array3, ArrayViewMut1, Axis, Zip};

use crate::core::{Int2, NeoError, NeoResult};

/// Default cap on a single launch, in work items.
pub const DEFAULT_MAX_WORK_ITEMS: usize = 1 << 24;

/// Counters of queue activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Kernel launches and fills enqueued
    pub launches: u64,
    /// Blocking host reads
    pub syncs: u64,
}

/// The in-order command queue every layer dispatches through.
#[derive(Debug, Clone)]
pub struct ComputeContext {
    max_work_items: usize,
    stats: QueueStats,
}

impl Default for ComputeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeContext {
    pub fn new() -> Self {
        Self {
            max_work_items: DEFAULT_MAX_WORK_ITEMS,
            stats: QueueStats::default(),
        }
    }

    /// Context that rejects launches larger than `max_work_items`.
    pub fn with_max_work_items(max_work_items: usize) -> Self {
        Self {
            max_work_items,
            stats: QueueStats::default(),
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    fn admit(&mut self, kernel: &'static str, work_items: usize) -> NeoResult<()> {
        if work_items == 0 {
            return Err(NeoError::Compute {
                kernel,
                reason: "empty launch range".to_string(),
            });
        }
        if work_items > self.max_work_items {
            return Err(NeoError::OutOfResources(format!(
                "kernel `{kernel}` requested {work_items} work items, limit is {}",
                self.max_work_items
            )));
        }
        self.stats.launches += 1;
        log::trace!("launch {kernel} over {work_items} items");
        Ok(())
    }

    /// Launch `f` over every position of `out`, writing its result there.
    pub fn launch_2d<F>(&mut self, kernel: &'static str, out: &mut Array2<f32>, f: F) -> NeoResult<()>
    where
        F: Fn(Int2) -> f32 + Sync,
    {
        self.admit(kernel, out.len())?;
        Zip::indexed(out).par_for_each(|(x, y), o| {
            *o = f(Int2::new(x as i32, y as i32));
        });
        Ok(())
    }

    /// Launch a kernel with three same-shaped outputs per position.
    pub fn launch_2d3<F>(
        &mut self,
        kernel: &'static str,
        out_a: &mut Array2<f32>,
        out_b: &mut Array2<f32>,
        out_c: &mut Array2<f32>,
        f: F,
    ) -> NeoResult<()>
    where
        F: Fn(Int2) -> (f32, f32, f32) + Sync,
    {
        if out_a.dim() != out_b.dim() || out_a.dim() != out_c.dim() {
            return Err(NeoError::Compute {
                kernel,
                reason: format!(
                    "output shapes differ: {:?}, {:?}, {:?}",
                    out_a.dim(),
                    out_b.dim(),
                    out_c.dim()
                ),
            });
        }
        self.admit(kernel, out_a.len())?;
        Zip::indexed(out_a)
            .and(out_b)
            .and(out_c)
            .par_for_each(|(x, y), a, b, c| {
                let (va, vb, vc) = f(Int2::new(x as i32, y as i32));
                *a = va;
                *b = vb;
                *c = vc;
            });
        Ok(())
    }

    /// Launch over the weight lanes of a tensor; one work item per hidden
    /// unit, each owning its whole receptive field.
    pub fn launch_fields<F>(&mut self, kernel: &'static str, out: &mut Array3<f32>, f: F) -> NeoResult<()>
    where
        F: Fn(Int2, ArrayViewMut1<f32>) + Sync,
    {
        self.admit(kernel, out.len())?;
        Zip::indexed(out.lanes_mut(Axis(2))).par_for_each(|(x, y), lane| {
            f(Int2::new(x as i32, y as i32), lane);
        });
        Ok(())
    }

    /// Like [`launch_fields`](Self::launch_fields) for two tensors updated
    /// together (weights and their eligibility traces).
    pub fn launch_fields2<F>(
        &mut self,
        kernel: &'static str,
        out_a: &mut Array3<f32>,
        out_b: &mut Array3<f32>,
        f: F,
    ) -> NeoResult<()>
    where
        F: Fn(Int2, ArrayViewMut1<f32>, ArrayViewMut1<f32>) + Sync,
    {
        if out_a.dim() != out_b.dim() {
            return Err(NeoError::Compute {
                kernel,
                reason: format!("tensor shapes differ: {:?} vs {:?}", out_a.dim(), out_b.dim()),
            });
        }
        self.admit(kernel, out_a.len())?;
        Zip::indexed(out_a.lanes_mut(Axis(2)))
            .and(out_b.lanes_mut(Axis(2)))
            .par_for_each(|(x, y), a, b| {
                f(Int2::new(x as i32, y as i32), a, b);
            });
        Ok(())
    }

    /// Enqueue a fill of `out` with a constant.
    pub fn fill(&mut self, kernel: &'static str, out: &mut Array2<f32>, value: f32) -> NeoResult<()> {
        self.admit(kernel, out.len())?;
        out.fill(value);
        Ok(())
    }

    /// Enqueue a copy of `src` into `dst`.
    pub fn copy(&mut self, kernel: &'static str, src: &Array2<f32>, dst: &mut Array2<f32>) -> NeoResult<()> {
        if src.dim() != dst.dim() {
            return Err(NeoError::Compute {
                kernel,
                reason: format!("copy between {:?} and {:?}", src.dim(), dst.dim()),
            });
        }
        self.admit(kernel, src.len())?;
        dst.assign(src);
        Ok(())
    }

    /// Blocking read of a surface back to host memory.
    pub fn read_surface(&mut self, surface: &Array2<f32>) -> Array2<f32> {
        self.stats.syncs += 1;
        surface.to_owned()
    }

    /// Block until every enqueued launch has completed.
    pub fn finish(&mut self) {
        self.stats.syncs += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_2d_writes_every_position() {
        let mut ctx = ComputeContext::new();
        let mut out = Array2::zeros((3, 4));
        ctx.launch_2d("index", &mut out, |p| (p.x * 10 + p.y) as f32).unwrap();
        assert_eq!(out[[2, 3]], 23.0);
        assert_eq!(out[[0, 1]], 1.0);
        assert_eq!(ctx.stats().launches, 1);
    }

    #[test]
    fn test_launch_fields_per_unit_lanes() {
        let mut ctx = ComputeContext::new();
        let mut w = Array3::zeros((2, 2, 5));
        ctx.launch_fields("lanes", &mut w, |p, mut lane| {
            lane.fill((p.x + 2 * p.y) as f32);
        })
        .unwrap();
        assert!(w.slice(ndarray::s![1, 1, ..]).iter().all(|&v| v == 3.0));
    }

    #[test]
    fn test_oversized_launch_is_out_of_resources() {
        let mut ctx = ComputeContext::with_max_work_items(8);
        let mut out = Array2::zeros((3, 3));
        let err = ctx.fill("fill", &mut out, 1.0).unwrap_err();
        assert!(matches!(err, NeoError::OutOfResources(_)));
        assert_eq!(ctx.stats().launches, 0);
    }

    #[test]
    fn test_empty_launch_rejected() {
        let mut ctx = ComputeContext::new();
        let mut out = Array2::zeros((0, 3));
        assert!(ctx.launch_2d("empty", &mut out, |_| 0.0).is_err());
    }

    #[test]
    fn test_read_surface_counts_sync() {
        let mut ctx = ComputeContext::new();
        let s = Array2::from_elem((2, 2), 0.5);
        let host = ctx.read_surface(&s);
        assert_eq!(host, s);
        assert_eq!(ctx.stats().syncs, 1);
    }
}
