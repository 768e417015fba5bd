//! # Kherimoya core
//!
//! Registry and lifecycle control for Minecraft Bedrock servers run through
//! the `endstone` launcher.
//!
//! Every server lives in its own directory, `<root>/servers/<name>@<id>`, and
//! runs inside a detached terminal session with the same name. The directory
//! tree is the only source of truth: there is no database and no index, and
//! every query rescans the servers directory.
//!
//! ## Layout
//!
//! ```text
//! <root>/servers/<name>@<id>/
//!   config/  extra/  server/  state/
//!   server.json          {"name": ..., "id": ...}
//!   state/state.json     {"running": ...}
//!   kherimoya.yaml       {type: python}
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use kherimoya_core::{RegistryConfig, ServerRegistry, SessionController, TmuxBackend};
//!
//! # async fn run() -> kherimoya_core::Result<()> {
//! let config = RegistryConfig::default();
//! let sessions = SessionController::new(
//!     Arc::new(TmuxBackend::new()),
//!     config.launcher.clone(),
//!     config.polling.clone(),
//! );
//! let registry = ServerRegistry::new("/srv/kherimoya", config, sessions);
//!
//! let server = registry.create("Alpha", None).await?;
//! println!("created {}", server);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod entity;
pub mod error;
pub mod ident;
pub mod metadata;
pub mod registry;
pub mod session;

pub use config::{LauncherSettings, PollSettings, RegistryConfig};
pub use entity::ServerEntity;
pub use error::{ErrorKind, Result, ServerError, SessionError};
pub use ident::IdentifierAllocator;
pub use metadata::ServerKind;
pub use registry::{ControlMethod, NewServer, ServerRegistry};
pub use session::{
    InMemorySessions, InstallBehavior, SessionBackend, SessionController, StopBehavior,
    TmuxBackend,
};
