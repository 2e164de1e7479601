//! Sub-module where RPC capabilities are located.
//!
//! [`capnp`] carries both wires over Cap'n Proto RPC: the debug wire exposing process control on
//! the target debug port, and the execution wire carried by the dial-back connection.

pub mod capnp;
