pub mod events;
pub mod health;
pub mod modules;

// Re-export all handlers for easy route registration
pub use events::{events_router, sessions_router};
pub use health::{health_handler, root_handler};
pub use modules::{DOMAIN_MODULES, detached};
