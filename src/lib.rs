// imei-relay library: intake portal → reference normalization → registry portal
// This exposes the core components for testing and integration

pub mod browser;
pub mod config;
pub mod errors;
pub mod export;
pub mod intake;
pub mod normalize;
pub mod reference;
pub mod registry;
pub mod shutdown;
pub mod telemetry;
pub mod types;
pub mod workflow;

// Re-export key types for easy access
pub use config::RelayConfig;
pub use errors::{PortalError, PortalKind};
pub use intake::{IntakeClient, IntakePortal};
pub use normalize::{normalize, Normalizer, Rejection};
pub use reference::ReferenceTable;
pub use registry::{RegistryClient, RegistryPortal, TokenProvider};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{generate_correlation_id, init_telemetry};
pub use types::{NormalizedRecord, PendingRequest};
pub use workflow::{RunReport, WorkflowOrchestrator, WorkflowState};
