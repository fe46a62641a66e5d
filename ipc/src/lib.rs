// This crate centralizes the launcher <-> daemon contract.

pub mod daemon_messages; // Routes and request bodies
pub mod port_file; // Port advertisement file shared by daemon generations
