//! Storage attribution runs
//!
//! An [`AttributionAssembler`] discovers candidate paths, hands them to the
//! measurement scheduler and streams one record per path followed by a run
//! summary. [`AttributionLoop`] repeats that on an interval.

mod assembler;
mod r#loop;

#[cfg(test)]
mod tests;

pub use assembler::{
    AssemblerConfig, AttributionAssembler, AttributionAssemblerBuilder, Discovery,
    DiscoveryDiagnostics, SourceFailure,
};
pub use r#loop::{AttributionLoop, DEFAULT_RUN_INTERVAL};

use crate::models::{AttributionRecord, RunSummary};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Event of an attribution run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum AttributionEvent {
    /// One attributed path or discovery failure, in completion order
    Record(AttributionRecord),
    /// Final event of the run
    Completed(RunSummary),
}

/// Handle to a running attribution cycle; dropping it cancels the run
pub struct AttributionRun {
    rx: mpsc::Receiver<AttributionEvent>,
}

impl AttributionRun {
    fn new(rx: mpsc::Receiver<AttributionEvent>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<AttributionEvent> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<AttributionEvent> {
        ReceiverStream::new(self.rx)
    }

    /// Wait for the whole run. A run that ends without a summary is
    /// reported as cancelled.
    pub async fn collect(mut self) -> (Vec<AttributionRecord>, RunSummary) {
        let mut records = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                AttributionEvent::Record(record) => records.push(record),
                AttributionEvent::Completed(summary) => return (records, summary),
            }
        }
        let summary = RunSummary {
            cancelled: true,
            ..Default::default()
        };
        (records, summary)
    }
}
