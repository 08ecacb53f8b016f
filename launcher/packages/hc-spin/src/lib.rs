//! hc-spin: launches local Holochain conductors for development and opens one
//! UI window per agent.

pub mod bridge;
pub mod cli;
pub mod conductor;
pub mod gate;
pub mod launch;
pub mod lines;
pub mod markers;
pub mod orchestrator;
pub mod ports;
pub mod readiness;
pub mod sandbox;
pub mod signer;
pub mod supervisor;
pub mod telemetry;
pub mod webhapp;
pub mod window;
pub mod workdir;
pub mod ws;
pub mod zome_call;
