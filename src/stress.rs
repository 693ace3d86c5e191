/// Memory pressure generator used to exercise a cgroup limit from a second invocation
use crate::types::{AllocationError, LaunchConfig, MIB};
use log::{debug, info, warn};
use std::thread;
use std::time::{Duration, Instant};

/// Supplies zero-filled chunks that stay allocated until the process exits
pub trait ChunkSource {
    fn allocate_chunk(&mut self, size: usize) -> Result<(), AllocationError>;
}

/// Allocates chunks from the heap, writes every byte, and leaks them.
#[derive(Debug, Default)]
pub struct HeapChunks {
    held: usize,
}

impl HeapChunks {
    /// Number of chunks leaked so far
    pub fn held(&self) -> usize {
        self.held
    }
}

impl ChunkSource for HeapChunks {
    fn allocate_chunk(&mut self, size: usize) -> Result<(), AllocationError> {
        let mut chunk: Vec<u8> = Vec::new();
        chunk
            .try_reserve_exact(size)
            .map_err(|_| AllocationError::OutOfMemory {
                requested: size as u64,
            })?;
        // Every byte is written so the pages are resident, not just mapped.
        chunk.resize(size, 0);
        let _ = chunk.leak();
        self.held += 1;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StressState {
    Running,
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StressOutcome {
    /// The full target was allocated
    Completed,
    /// A chunk allocation failed; `shortfall` bytes were never allocated
    Exhausted { shortfall: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StressReport {
    pub target: u64,
    pub allocated: u64,
    pub chunks: u64,
    pub outcome: StressOutcome,
}

pub struct StressGenerator<S: ChunkSource> {
    source: S,
    target: u64,
    chunk_size: usize,
    pause: Duration,
    progress_interval: Duration,
    state: StressState,
    allocated: u64,
    chunks: u64,
    outcome: Option<StressOutcome>,
    last_progress: Instant,
    progress_lines: u64,
}

impl<S: ChunkSource> StressGenerator<S> {
    pub fn new(source: S, target: u64) -> Self {
        Self::with_config(source, target, &LaunchConfig::default())
    }

    pub fn with_config(source: S, target: u64, config: &LaunchConfig) -> Self {
        Self {
            source,
            target,
            chunk_size: config.chunk_size.max(1),
            pause: config.pause(),
            progress_interval: config.progress_interval(),
            state: StressState::Running,
            allocated: 0,
            chunks: 0,
            outcome: None,
            last_progress: Instant::now(),
            progress_lines: 0,
        }
    }

    pub fn state(&self) -> StressState {
        self.state
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Progress lines emitted so far; at most one per progress interval
    pub fn progress_lines(&self) -> u64 {
        self.progress_lines
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Perform at most one allocation and return the resulting state.
    pub fn step(&mut self) -> StressState {
        if self.state == StressState::Done {
            return self.state;
        }

        if self.allocated >= self.target {
            self.finish(StressOutcome::Completed);
            return self.state;
        }

        if let Err(e) = self.source.allocate_chunk(self.chunk_size) {
            let shortfall = self.target - self.allocated;
            warn!(
                "Memory allocation failed at {} MB ({}); {} MB short of the {} MB target",
                self.allocated / MIB,
                e,
                shortfall / MIB,
                self.target / MIB
            );
            self.finish(StressOutcome::Exhausted { shortfall });
            return self.state;
        }

        self.allocated += self.chunk_size as u64;
        self.chunks += 1;

        if self.last_progress.elapsed() >= self.progress_interval {
            debug!(
                "Allocated {} MB, Total allocated: {} MB",
                self.chunk_size as u64 / MIB,
                self.allocated / MIB
            );
            self.last_progress = Instant::now();
            self.progress_lines += 1;
        }

        if self.allocated >= self.target {
            self.finish(StressOutcome::Completed);
        } else if !self.pause.is_zero() {
            thread::sleep(self.pause);
        }

        self.state
    }

    /// Allocate until the target is reached or an allocation fails.
    pub fn run(&mut self) -> StressReport {
        info!(
            "Starting stress test to allocate {} MB of memory",
            self.target / MIB
        );
        while self.step() == StressState::Running {}
        self.report()
    }

    pub fn report(&self) -> StressReport {
        StressReport {
            target: self.target,
            allocated: self.allocated,
            chunks: self.chunks,
            outcome: self.outcome.unwrap_or(StressOutcome::Exhausted {
                shortfall: self.target.saturating_sub(self.allocated),
            }),
        }
    }

    fn finish(&mut self, outcome: StressOutcome) {
        if outcome == StressOutcome::Completed {
            info!(
                "Stress test completed. Total allocated memory: {} MB",
                self.allocated / MIB
            );
        }
        self.outcome = Some(outcome);
        self.state = StressState::Done;
    }
}

/// Allocate `target` bytes of committed heap memory in chunks and hold it.
pub fn stress(target: u64, config: &LaunchConfig) -> StressReport {
    StressGenerator::with_config(HeapChunks::default(), target, config).run()
}
