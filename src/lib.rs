//! Core library for the psu_stopper application.
//!
//! This library contains the acquisition loop, instrument drivers, sample
//! buffering, export writers and the run controller used by the command-line
//! front end.

pub mod acquisition;
pub mod adapters;
pub mod alert;
pub mod app_actor;
pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod instrument;
pub mod messages;
