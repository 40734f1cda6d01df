//! migraph CLI - command-line interface for migraph.
//!
//! This crate provides the `migraph` tool for maintaining dependency-ordered
//! SQL migrations: adding migrations, applying and reverting them, fixing up
//! ID collisions after a rebase, and squashing old migrations.

pub mod cli;
pub mod commands;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod output;
