//! Authenticated REST calls against the platform API.

mod error;
mod transport;

pub use error::{TransportError, TransportResult};
pub use transport::RestTransport;
