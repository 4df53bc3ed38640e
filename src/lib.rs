pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod ids;
pub mod multipart;
pub mod protocol;
pub mod transport;

pub use auth::AuthHeaders;
pub use config::{AvsConfig, ConfigError};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{AvsError, Result};
pub use ids::{FixedIds, IdGenerator, UuidIdGenerator};
pub use protocol::{AvsResponse, Directive};
