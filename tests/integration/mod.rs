//! Integration tests for layerpeek
//!
//! `bundle` parses and extracts from synthetic image tarballs; `registry`
//! drives the client against an in-process fake registry.

pub mod registry;
