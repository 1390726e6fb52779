pub mod errors;
pub mod requery;
pub mod service;
pub mod types;

pub use errors::{DispatchError, RequeryError, RequeryServiceError};
pub use requery::{
    RequeryCollaborators, RequerySupervisor, SendOutcome, SendPolicy, SupervisorConfig,
    SupervisorSnapshot,
};
pub use service::{
    RequeryCommand, RequeryServiceConfig, RequeryServiceHandle, RequeryServiceStatus,
    start_service,
};
pub use types::{FileHash, QueryType, SearchQuery};
