//! Typed errors for the core request pipeline.
//!
//! The core never aborts the process. Every fallible path returns one of
//! these enums; the event loop and `main` decide whether a variant is
//! fatal (initial config load), silently dropped (malformed/ACL/unknown
//! export), or turned into an AoE error reply (write-protected/IO/backing
//! device unavailable).

use std::io;

use thiserror::Error;

use crate::codec::AoeErrorCode;

/// Errors produced while handling a single inbound frame.
///
/// Each variant records, via [`CoreError::policy`], whether it silently
/// drops the frame (incrementing a counter) or produces an AoE error
/// reply carrying [`AoeErrorCode`].
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("frame too short or malformed for its declared opcode")]
    MalformedFrame,

    #[error("no device configured for the requested (shelf, slot)")]
    UnknownExport,

    #[error("initiator MAC rejected by device ACL")]
    AclDenied,

    #[error("write to a read-only export")]
    WriteProtected,

    #[error("backing I/O failed: {0}")]
    IoFailed(#[source] io::Error),

    #[error("backing device is unavailable")]
    BackingUnavailable,

    #[error("buffer pool exhausted")]
    ExhaustedBuffers,
}

/// How the router/device must react to a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Drop silently, bump a counter, never reply.
    SilentDrop,
    /// Reply with the AoE error code, tag preserved.
    Reply(AoeErrorCode),
}

impl CoreError {
    pub fn policy(&self) -> ErrorPolicy {
        match self {
            CoreError::MalformedFrame | CoreError::UnknownExport | CoreError::AclDenied => {
                ErrorPolicy::SilentDrop
            }
            CoreError::ExhaustedBuffers => ErrorPolicy::SilentDrop,
            CoreError::WriteProtected => ErrorPolicy::Reply(AoeErrorCode::WriteProtected),
            CoreError::IoFailed(_) => ErrorPolicy::Reply(AoeErrorCode::DeviceFault),
            CoreError::BackingUnavailable => ErrorPolicy::Reply(AoeErrorCode::AbortedCommand),
        }
    }

    /// The counter this error increments, for `Snapshot` reporting.
    pub fn counter_name(&self) -> &'static str {
        match self {
            CoreError::MalformedFrame => "malformed_frame",
            CoreError::UnknownExport => "unknown_export",
            CoreError::AclDenied => "acl_denied",
            CoreError::ExhaustedBuffers => "exhausted_buffers",
            CoreError::WriteProtected => "write_protected",
            CoreError::IoFailed(_) => "io_failed",
            CoreError::BackingUnavailable => "backing_unavailable",
        }
    }
}

/// Errors setting up or tearing down a [`crate::netif::Netif`].
#[derive(Debug, Error)]
pub enum NetifError {
    #[error("failed to open raw socket on {iface}: {source}")]
    SocketOpen { iface: String, source: io::Error },

    #[error("failed to install {ring} ring on {iface}: {source}")]
    RingSetup {
        iface: String,
        ring: &'static str,
        source: io::Error,
    },

    #[error("failed to bind to interface {iface}: {source}")]
    Bind { iface: String, source: io::Error },
}

/// Errors setting up a [`crate::device::Device`]'s backing store or
/// async I/O context.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open backing path {path}: {source}")]
    Open { path: String, source: io::Error },

    #[error("failed to initialize the async I/O context: {source}")]
    AioSetup(#[source] io::Error),
}
