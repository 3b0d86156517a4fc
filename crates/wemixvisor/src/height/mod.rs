//! Observation of the node's block height: a transport-agnostic
//! [`HeightProvider`] capability and the [`HeightMonitor`] poll loop fanning
//! height changes out to subscribers.

pub(crate) mod monitor;
pub(crate) mod provider;

pub use monitor::{
    HeightMonitor,
    HeightReader,
};
pub use provider::{
    HeightProvider,
    RpcHeightProvider,
};
