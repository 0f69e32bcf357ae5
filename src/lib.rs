//! Edge cache node for a centrally controlled image-distribution network.
//!
//! A node registers with a central control plane, receives a signed TLS
//! certificate and an operating policy over that channel, then serves client
//! requests for cached images directly over TLS — fetching from an upstream
//! origin on a cache miss and storing the result under a content-addressed,
//! fan-out layout on disk.
//!
//! # Key concepts
//! - [cache] stores and evicts cached image bytes on disk, indexed in `sled`.
//! - [token] verifies the per-request access token attached to a URL.
//! - [control] talks to the control plane (heartbeat, certificate fetch, shutdown).
//! - [cert] holds the current TLS keypair behind an atomic pointer swap.
//! - [policy] holds the current operating policy the same way.
//! - [listener] accepts TLS connections and peeks SNI before completing the handshake.
//! - [pipeline] implements the client-facing request handling stages.
//! - [supervisor] wires the above together and drives the heartbeat/shutdown lifecycle.
//!
//! The HTTP substrate (routing, extractors, responses, streaming bodies) is a
//! small in-house framework, kept in [router], [extractors], [responder],
//! [body], [handler] and [middleware].

/// HTTP request and response body handling utilities.
pub mod body;

/// Request data extraction utilities for parsing headers and client addresses.
pub mod extractors;

/// Request handler traits and implementations.
pub mod handler;

/// Middleware for processing requests and responses in a pipeline.
pub mod middleware;

/// Response generation utilities and traits.
pub mod responder;

/// Route definition and matching logic.
pub mod route;

/// Request routing and dispatch functionality.
pub mod router;

/// Application state management and dependency injection.
pub mod state;

/// In-process signal arbiter for custom events.
pub mod signals;

/// Core type definitions used throughout the framework.
pub mod types;

/// Structured logging setup (`tracing` subscriber, env-filter).
pub mod logging;

/// Static configuration loaded once at startup.
pub mod config;

/// Command-line interface.
pub mod cli;

/// The content store: on-disk cache layout, index, and eviction.
pub mod cache;

/// Per-request access token verification.
pub mod token;

/// Control-plane client: heartbeat, certificate fetch, shutdown.
pub mod control;

/// Operating policy, held behind an atomic pointer swap.
pub mod policy;

/// TLS certificate holder, held behind an atomic pointer swap.
pub mod cert;

/// Pooled HTTP client for fetching images from the upstream origin.
pub mod upstream;

/// TLS listener: SNI peek, handshake, per-connection serving.
pub mod listener;

/// The client-facing request handling pipeline.
pub mod pipeline;

/// Prometheus metrics and the `/metrics` / `/robots.txt` handlers.
pub mod metrics;

/// Component wiring, heartbeat loop, certificate rotation, graceful shutdown.
pub mod supervisor;

pub use bytes::Bytes;
pub use http::{Method, StatusCode, header};
pub use http_body_util::Full;
pub use responder::NOT_FOUND;
