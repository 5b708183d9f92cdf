//! cohort-network: Port allocation for worker environments
//!
//! Every running job talks to its simulation environment over a local TCP
//! port. This crate finds ports that are free at the moment of the check and
//! keeps track of the ports handed out during a run.

pub mod ports;

pub use ports::{next_free_port, next_free_port_with, PortPool, PortProbe, TcpPortProbe};
