//! Seams between the orchestrator and the outside world.
//!
//! The orchestrator never touches a page or a data source directly: it hands messages to an
//! [`ExecutionSurface`] and asks a [`RowResolver`] for the data rows a run iterates over.

use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use rowpilot_types::{DataRow, RunOptions, SurfaceMessage, Workflow};

use crate::error::DispatchError;

/// Where workflow messages are delivered (for example a browser tab).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub id: String,
}

impl Destination {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// The context that actually runs steps and reports progress back as surface events.
#[async_trait]
pub trait ExecutionSurface: Send + Sync {
    /// Locates (or opens) the destination that will run the next workflow.
    async fn acquire(&self) -> Result<Destination, DispatchError>;

    /// Delivers one message to `destination`.
    async fn send(&self, destination: &Destination, message: SurfaceMessage) -> Result<(), DispatchError>;
}

/// Supplies the data rows a workflow iterates over.
#[async_trait]
pub trait RowResolver: Send + Sync {
    async fn resolve_rows(&self, workflow: &Workflow, options: &RunOptions) -> anyhow::Result<Vec<DataRow>>;
}

/// Row resolver backed by rows already in memory.
///
/// With a sample cap the resolver returns a random subset of at most that many rows, kept in their
/// original order. A seed makes the sample reproducible.
#[derive(Debug, Clone, Default)]
pub struct InlineRowResolver {
    rows: Vec<DataRow>,
    sample_cap: Option<usize>,
    seed: Option<u64>,
}

impl InlineRowResolver {
    pub fn new(rows: Vec<DataRow>) -> Self {
        Self {
            rows,
            sample_cap: None,
            seed: None,
        }
    }

    /// A single empty row, for workflows that do not read data.
    pub fn single_pass() -> Self {
        Self::new(vec![DataRow::new()])
    }

    pub fn with_sample_cap(mut self, cap: usize) -> Self {
        self.sample_cap = Some(cap);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn rows(&self) -> Vec<DataRow> {
        match self.sample_cap {
            Some(cap) if cap < self.rows.len() => self.sample(cap),
            _ => self.rows.clone(),
        }
    }

    fn sample(&self, cap: usize) -> Vec<DataRow> {
        let mut picked = match self.seed {
            Some(seed) => index::sample(&mut StdRng::seed_from_u64(seed), self.rows.len(), cap).into_vec(),
            None => index::sample(&mut rand::thread_rng(), self.rows.len(), cap).into_vec(),
        };
        picked.sort_unstable();
        picked.into_iter().map(|position| self.rows[position].clone()).collect()
    }
}

#[async_trait]
impl RowResolver for InlineRowResolver {
    async fn resolve_rows(&self, _workflow: &Workflow, _options: &RunOptions) -> anyhow::Result<Vec<DataRow>> {
        Ok(self.rows())
    }
}
