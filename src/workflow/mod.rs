//! End-to-end relay of pending requests: intake → normalize → registry → confirm.

pub mod journal;
pub mod orchestrator;
pub mod retry;
pub mod state;

#[cfg(test)]
mod mocks;
#[cfg(test)]
mod tests;

pub use journal::{JournalError, StateJournal};
pub use orchestrator::{OrchestratorSettings, RunMode, RunReport, WorkflowError, WorkflowOrchestrator};
pub use retry::RetryPolicy;
pub use state::{RequestState, Stage, Step, TerminalOutcome, TransitionError, WorkflowState};
