use rayon::prelude::*;
use rayon::ThreadPool;
use std::sync::Arc;

pub fn offset_to_indices(mut offset: usize, shape: &[usize]) -> Vec<usize> {
    let mut indices = vec![0; shape.len()];
    for i in (0..shape.len()).rev() {
        indices[i] = offset % shape[i];
        offset /= shape[i];
    }
    indices
}

/// Work-size gate plus the pool the rows run on.
#[derive(Clone, Default)]
pub struct Parallelism {
    pub pool: Option<Arc<ThreadPool>>,
    /// Minimum multiply-accumulate count before rows are spread over threads.
    pub threshold: usize,
}

impl Parallelism {
    pub fn new(pool: Option<Arc<ThreadPool>>, threshold: usize) -> Self {
        Self { pool, threshold }
    }

    pub fn should_parallelize(&self, work: usize) -> bool {
        work >= self.threshold && self.threads() > 1
    }

    pub fn threads(&self) -> usize {
        match &self.pool {
            Some(p) => p.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    /// Calls `f(row)` for every row in `0..rows`. Rows must write disjoint output.
    pub fn for_each_row<F>(&self, work: usize, rows: usize, f: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        if !self.should_parallelize(work) {
            (0..rows).for_each(f);
            return;
        }
        match &self.pool {
            Some(pool) => pool.install(|| (0..rows).into_par_iter().for_each(&f)),
            None => (0..rows).into_par_iter().for_each(&f),
        }
    }
}

#[derive(Copy, Clone)]
pub struct SendPtr<T>(pub usize, std::marker::PhantomData<T>);
unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

impl<T> SendPtr<T> {
    pub fn new(ptr: *mut T) -> Self {
        Self(ptr as usize, std::marker::PhantomData)
    }
    pub fn as_ptr(self) -> *mut T {
        self.0 as *mut T
    }

    /// # Safety
    /// `idx` must be in bounds of the original allocation and no other thread
    /// may write the same index concurrently.
    #[inline]
    pub unsafe fn write(self, idx: usize, v: T) {
        unsafe { *self.as_ptr().add(idx) = v };
    }
}
