/// Explicit description of where and how numeric work is executed.
///
/// Everything runs on the CPU in `f32`. The only knob is how many worker
/// threads the matrix products inside convolutions may fan out to; the
/// optimization itself is always driven from a single thread.
#[derive(Copy, Clone, Debug)]
pub struct ExecutionContext {
    max_thread_count: usize,
}

impl ExecutionContext {
    /// Creates a context that uses at most `max_thread_count` threads, a
    /// count of 0 is treated as 1
    pub fn new(max_thread_count: usize) -> Self {
        Self {
            max_thread_count: max_thread_count.max(1),
        }
    }

    /// A single threaded context, which gives completely deterministic
    /// results
    pub fn single_threaded() -> Self {
        Self::new(1)
    }

    #[inline]
    pub fn max_thread_count(&self) -> usize {
        self.max_thread_count
    }
}

impl Default for ExecutionContext {
    /// Uses the number of logical cores on this system
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}
