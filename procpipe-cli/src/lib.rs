//! Crate for `procpipe`, a command-line front end for `procpipe-core`.

pub mod args;
pub mod config;
pub mod entry;
mod error;
pub mod events;
mod output;
mod productinfo;
