//! practica - session synchronization for timed, role-based consultation practice
//!
//! This crate provides the core functionality for practica, including:
//! - Session records, role assignment and durable storage
//! - Phase scheduling with server-authoritative deadlines
//! - Per-session event broadcast with ordered delivery
//! - Client-server protocol over TCP
//!
//! # Architecture
//!
//! practica uses a client-server model where:
//! - The server (`practica-server`) owns every session and its timers
//! - The client (`practica`) joins a session by code and renders its events
//! - Each live session is driven by one actor task, so actions on a session
//!   are applied one at a time while different sessions run independently

pub mod client;
pub mod collab;
pub mod config;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod logging;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod session;
