pub mod declaration;
pub mod graph;
pub mod implementation;
pub mod lifecycle;
pub mod logging;
pub mod models;
pub mod registry;
pub mod remote;
pub mod scheduler;
