//! Raw capture and normalization of trial-balance exports.
//!
//! Files are classified and stored row by row exactly as received
//! ([`pipeline::Pipeline::submit`]); a separate, retryable pass resolves
//! column roles, parses amounts and accounts, and validates the result
//! ([`pipeline::Pipeline::normalize`]).

pub mod advisory;
pub mod assembler;
pub mod classifier;
pub mod db;
pub mod document;
pub mod error;
pub mod fmt;
pub mod models;
pub mod numeric;
pub mod pipeline;
pub mod roles;
pub mod settings;
pub mod tabular;
pub mod validator;
