pub mod buffer;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod dns;
pub mod error;
pub mod listener;
pub mod mode;
pub mod request;
pub mod response;
pub mod types;

#[cfg(test)]
mod testing;

pub use buffer::BoundedBuffer;
pub use config::{AccessPointConfig, NetworkConfig, RuntimeConfig, ServerConfig};
pub use connection::{
    CloseReason, Closed, ConnectionEvents, ConnectionId, ConnectionState, Endpoint, Flow, Phase,
};
pub use credentials::{extract_credentials, url_decode, Credentials, ProvisioningResult};
pub use dns::captive_answer;
pub use error::{
    AcceptError, CredentialError, CredentialField, ModeError, OpenError, OpenStage,
    ResponseError, StackError,
};
pub use listener::{shutdown_server, ListenSocket, ProvisioningServer, Stack};
pub use mode::{Cutover, ModeController, RadioServices};
pub use request::{parse_request, Request};
pub use response::{Page, Response, StatusLed};
pub use types::{DeviceMode, LedState, Method};
