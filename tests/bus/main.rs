//! Bus integration tests over the in-memory transport.

mod support;

mod commands;
mod events;
mod multicast;
mod requests;
