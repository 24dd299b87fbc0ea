pub mod actor;
pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod guard;
pub mod handlers;
pub mod lifecycle;
pub mod middleware;
pub mod policy;
pub mod query;
pub mod resource;
pub mod service;
pub mod store;
pub mod types;

pub use actor::{Actor, ActorResolver, Role};
pub use error::{GuardError, GuardResult};
pub use handlers::{router, AppState};
pub use policy::{PolicyRegistry, ResourcePolicy};
pub use service::ResourceService;
