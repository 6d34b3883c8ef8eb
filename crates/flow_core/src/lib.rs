//! Flow controller for operator actions against a credit-network backend:
//! payments, trustline create/update/close, and clearing runs.

pub mod amount;
pub mod armer;
pub mod capability;
pub mod config;
pub mod controller;
pub mod escape;
pub mod gateway;
pub mod history;
pub mod http_gateway;
pub mod notice;
pub mod phase;
pub mod selection;

pub use capability::{CapabilityKey, CapabilityState};
pub use config::{FlowOptions, RoutingMode};
pub use controller::{FlowController, FlowEvent, FlowOutcome, FlowSnapshot};
pub use escape::{EscapeResolution, OverlayKind};
pub use gateway::{ActionGateway, GatewayError, GatewayResult};
pub use http_gateway::HttpActionGateway;
pub use phase::Phase;
