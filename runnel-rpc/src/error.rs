//! Mapping of internal errors onto gRPC status codes.
//!
//! The code matters to callers: UNAVAILABLE marks a transient network
//! condition the forwarder may retry, everything else is an application
//! verdict that would be identical on any replica.

use crate::registry::RegistryError;
use runnel_model::{AuthError, PlacementError, StorageError};
use runnel_node::{CacheError, SyncError};
use tonic::Status;

pub(crate) fn storage_status(err: StorageError) -> Status {
    match err {
        StorageError::NotFound(id) => Status::not_found(format!("stream not found: {id}")),
        StorageError::AlreadyExists(id) => {
            Status::already_exists(format!("stream already exists: {id}"))
        }
        StorageError::BadMiniblockNum { .. } | StorageError::MinipoolMismatch { .. } => {
            Status::invalid_argument(err.to_string())
        }
        StorageError::Backend(msg) => Status::internal(msg),
    }
}

pub(crate) fn cache_status(err: CacheError) -> Status {
    match err {
        CacheError::NotFound(id) => Status::not_found(format!("stream not found: {id}")),
        CacheError::NotLocal(id) => {
            Status::failed_precondition(format!("stream not hosted here: {id}"))
        }
        CacheError::BadCookie(msg) => Status::invalid_argument(msg),
        CacheError::Placement(err) => placement_status(err),
        CacheError::Storage(err) => storage_status(err),
    }
}

pub(crate) fn placement_status(err: PlacementError) -> Status {
    match err {
        PlacementError::NotRegistered(id) => {
            Status::not_found(format!("stream not registered: {id}"))
        }
        PlacementError::NoNodes => Status::failed_precondition("no nodes available for placement"),
        PlacementError::Source(msg) => Status::internal(msg),
    }
}

pub(crate) fn auth_status(err: AuthError) -> Status {
    match err {
        AuthError::Rejected { .. } => Status::permission_denied(err.to_string()),
        AuthError::Source(msg) => Status::internal(msg),
    }
}

pub(crate) fn registry_status(err: RegistryError) -> Status {
    match err {
        RegistryError::UnknownNode(addr) => {
            Status::failed_precondition(format!("unknown node: {addr}"))
        }
        RegistryError::LocalNode(_) | RegistryError::BadEndpoint { .. } => {
            Status::internal(err.to_string())
        }
    }
}

pub(crate) fn sync_status(err: SyncError) -> Status {
    match err {
        SyncError::QueueFull(_) => Status::resource_exhausted(err.to_string()),
        SyncError::Protocol(msg) => Status::internal(msg),
        SyncError::Transport(msg) => Status::unavailable(msg),
        SyncError::Cancelled => Status::cancelled("sync cancelled"),
    }
}
