//! Link management: connection supervisor and the public facade.

pub mod facade;
pub mod supervisor;
