//! Integration test suite for kvs-relay.
//!
//! These tests run real worker processes: `/bin/sh` stands in for the media binary,
//! executing a script named after the target id from the worker directory.
//!
//! # Test Categories
//!
//! - `supervisor_lifecycle`: start, reconnect, handoff and the single-worker invariant
//! - `recovery`: liveness-triggered relaunch and shutdown behaviour
//! - `stream_service`: the inbound start/reconnect payloads

#![cfg(unix)]

mod fixtures;

mod supervisor_lifecycle;
