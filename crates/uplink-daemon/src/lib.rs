//! Uplink Daemon - SFTP front end that hands completed uploads to S3
//!
//! This crate provides:
//! - SSH password authentication against an external identity service
//! - An SFTP subsystem that accepts uploads and refuses everything else
//! - In-memory upload buffering and a one-shot handoff to object storage
//! - The connection supervisor and the `uplink` binary
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ConnectionSupervisor (accept loop, connection limit)       │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ task per connection
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  SshSession ── Authenticator ── IdentityVerifier (STS)      │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ task per sftp channel
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  SftpChannel ── CommandDispatcher ── UploadRegistry         │
//! │                                  └── StorageHandoff (S3)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything below the supervisor is reachable without a socket, so the
//! dispatcher, registry and handoff can be driven directly in tests.

pub mod auth;
pub mod aws;
pub mod deadline;
pub mod dispatch;
pub mod handoff;
pub mod sftp;
pub mod ssh;
pub mod supervisor;
pub mod upload;

pub use auth::{Authenticator, CallerIdentity, IdentityError, IdentityVerifier, SessionAuthenticator};
pub use aws::{S3ObjectStore, StsIdentityVerifier};
pub use dispatch::{CommandDispatcher, Decision};
pub use handoff::{ObjectStore, StorageHandoff, StoreError};
pub use supervisor::{ConnectionSupervisor, SupervisorError};
pub use upload::{Closed, UploadRegistry, UploadState};
