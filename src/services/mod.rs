pub mod bridge;
pub mod factory;
pub mod gateway;
pub mod headers;
pub mod registry;

pub(crate) use factory::SessionParams;
pub(crate) use gateway::Gateway;
