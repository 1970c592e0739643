// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the datastore

use super::lock::LockError;
use diesel::result::DatabaseErrorInformation;
use diesel::result::DatabaseErrorKind as DieselErrorKind;
use diesel::result::Error as DieselError;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::fmt::Display;

/// A lease event that cannot be applied as given.
///
/// These are never retried: the rack reported something the region cannot
/// make sense of (an unknown action, an address outside every subnet, a
/// family that disagrees with the subnet, and so on).
#[derive(
    Clone, Debug, Deserialize, PartialEq, Eq, Serialize, thiserror::Error,
)]
#[error("{0}")]
pub struct LeaseUpdateError(pub String);

impl LeaseUpdateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Kinds of rows that can be named in an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceType {
    Vlan,
    Subnet,
    IpRange,
    Node,
    Interface,
    StaticIpAddress,
    Domain,
    DnsResource,
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceType::Vlan => "vlan",
            ResourceType::Subnet => "subnet",
            ResourceType::IpRange => "ip range",
            ResourceType::Node => "node",
            ResourceType::Interface => "interface",
            ResourceType::StaticIpAddress => "static ip address",
            ResourceType::Domain => "domain",
            ResourceType::DnsResource => "dns resource",
        };
        f.write_str(name)
    }
}

/// An error produced by a [`super::DataStore`] operation.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    /// The lease event was rejected.
    #[error(transparent)]
    LeaseUpdate(#[from] LeaseUpdateError),

    /// An advisory lock was misused.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// An object needed as part of this operation was not found.
    #[error("Object (of type {type_name}) not found: {lookup}")]
    ObjectNotFound { type_name: ResourceType, lookup: String },

    /// An object already exists with the specified name or key.
    #[error("Object (of type {type_name}) already exists: {object_name}")]
    ObjectAlreadyExists { type_name: ResourceType, object_name: String },

    /// The request was well-formed, but cannot be completed given the
    /// current state of the database.
    #[error("Invalid Request: {message}")]
    InvalidRequest { message: String },

    /// Every attempt of a transaction lost a serialization race.
    #[error(
        "transaction {name:?} failed after {attempts} attempts: \
         serialization conflict"
    )]
    TransactionConflict { name: String, attempts: u32 },

    /// The database could not be reached.
    #[error("Service Unavailable: {internal_message}")]
    ServiceUnavailable { internal_message: String },

    /// The datastore found itself in a state that should not be possible.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },
}

impl Error {
    pub fn not_found(type_name: ResourceType, lookup: impl Display) -> Error {
        Error::ObjectNotFound { type_name, lookup: lookup.to_string() }
    }

    pub fn already_exists(
        type_name: ResourceType,
        object_name: impl Display,
    ) -> Error {
        Error::ObjectAlreadyExists {
            type_name,
            object_name: object_name.to_string(),
        }
    }

    pub fn invalid_request(message: &str) -> Error {
        Error::InvalidRequest { message: message.to_owned() }
    }

    pub fn internal_error(internal_message: &str) -> Error {
        Error::InternalError { internal_message: internal_message.to_owned() }
    }

    /// Given an [`Error`] with an internal message, return the same error
    /// with `context` prepended to it
    ///
    /// Errors without an internal message are returned unchanged.
    pub fn internal_context<C>(self, context: C) -> Error
    where
        C: Display,
    {
        match self {
            Error::InternalError { internal_message } => Error::InternalError {
                internal_message: format!("{}: {}", context, internal_message),
            },
            Error::LeaseUpdate(_)
            | Error::Lock(_)
            | Error::ObjectNotFound { .. }
            | Error::ObjectAlreadyExists { .. }
            | Error::InvalidRequest { .. }
            | Error::TransactionConflict { .. }
            | Error::ServiceUnavailable { .. } => self,
        }
    }
}

impl From<bb8::RunError<async_bb8_diesel::ConnectionError>> for Error {
    fn from(error: bb8::RunError<async_bb8_diesel::ConnectionError>) -> Error {
        Error::ServiceUnavailable {
            internal_message: format!(
                "Failed to access connection pool: {}",
                error
            ),
        }
    }
}

pub type CreateResult<T> = Result<T, Error>;
pub type ListResult<T> = Result<Vec<T>, Error>;
pub type LookupResult<T> = Result<T, Error>;
pub type UpdateResult<T> = Result<T, Error>;

/// Like anyhow's `context`, for errors that carry an internal message.
pub trait InternalContext<T> {
    fn internal_context<C>(self, context: C) -> Result<T, Error>
    where
        C: Display;

    fn with_internal_context<C, F>(self, make_context: F) -> Result<T, Error>
    where
        C: Display,
        F: FnOnce() -> C;
}

impl<T> InternalContext<T> for Result<T, Error> {
    fn internal_context<C>(self, context: C) -> Result<T, Error>
    where
        C: Display,
    {
        self.map_err(|error| error.internal_context(context))
    }

    fn with_internal_context<C, F>(self, make_context: F) -> Result<T, Error>
    where
        C: Display,
        F: FnOnce() -> C,
    {
        self.map_err(|error| error.internal_context(make_context()))
    }
}

/// Summarizes details provided with a database error.
fn format_database_error(
    kind: DieselErrorKind,
    info: &dyn DatabaseErrorInformation,
) -> String {
    let mut rv =
        format!("database error (kind = {:?}): {}\n", kind, info.message());
    if let Some(details) = info.details() {
        rv.push_str(&format!("DETAILS: {}\n", details));
    }
    if let Some(hint) = info.hint() {
        rv.push_str(&format!("HINT: {}\n", hint));
    }
    if let Some(table_name) = info.table_name() {
        rv.push_str(&format!("TABLE NAME: {}\n", table_name));
    }
    if let Some(constraint_name) = info.constraint_name() {
        rv.push_str(&format!("CONSTRAINT NAME: {}\n", constraint_name));
    }
    rv
}

/// Describes how a Diesel error should be reported to the caller.
pub enum ErrorHandler<'a> {
    /// A missing row is the caller's problem.
    NotFound(ResourceType, &'a str),
    /// A uniqueness conflict is the caller's problem.
    Conflict(ResourceType, &'a str),
    /// Everything is a server error.
    Server,
}

/// Converts a Diesel error to an [`Error`].
pub fn public_error_from_diesel(
    error: DieselError,
    handler: ErrorHandler<'_>,
) -> Error {
    match (error, handler) {
        (DieselError::NotFound, ErrorHandler::NotFound(type_name, lookup)) => {
            Error::not_found(type_name, lookup)
        }
        (
            DieselError::DatabaseError(DieselErrorKind::UniqueViolation, _),
            ErrorHandler::Conflict(type_name, object_name),
        ) => Error::already_exists(type_name, object_name),
        (DieselError::DatabaseError(kind, info), _) => {
            Error::internal_error(&format_database_error(kind, &*info))
        }
        (error, _) => Error::internal_error(&format!(
            "Unknown diesel error: {:?}",
            error
        )),
    }
}

/// The error type of a transaction closure.
///
/// `Database` is kept as the raw Diesel error so that a serialization
/// failure can be recognized and the transaction retried; everything the
/// closure decides for itself is `Custom`.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error(transparent)]
    Custom(#[from] Error),
    #[error("Transaction error: {0}")]
    Database(#[from] DieselError),
}

impl TransactionError {
    /// Maps a Diesel error through `handler`, except for serialization
    /// failures, which stay retryable.
    pub fn from_diesel(
        error: DieselError,
        handler: ErrorHandler<'_>,
    ) -> TransactionError {
        if is_serialization_failure(&error) {
            TransactionError::Database(error)
        } else {
            TransactionError::Custom(public_error_from_diesel(error, handler))
        }
    }

    /// Whether running the transaction again may succeed.
    pub fn retryable(&self) -> bool {
        match self {
            TransactionError::Database(error) => {
                is_serialization_failure(error)
            }
            TransactionError::Custom(_) => false,
        }
    }
}

fn is_serialization_failure(error: &DieselError) -> bool {
    matches!(
        error,
        DieselError::DatabaseError(DieselErrorKind::SerializationFailure, _)
    )
}

impl From<LockError> for TransactionError {
    fn from(error: LockError) -> TransactionError {
        TransactionError::Custom(Error::from(error))
    }
}

impl From<LeaseUpdateError> for TransactionError {
    fn from(error: LeaseUpdateError) -> TransactionError {
        TransactionError::Custom(Error::from(error))
    }
}

impl From<TransactionError> for Error {
    fn from(error: TransactionError) -> Error {
        match error {
            TransactionError::Custom(error) => error,
            TransactionError::Database(error) => {
                public_error_from_diesel(error, ErrorHandler::Server)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::public_error_from_diesel;
    use super::DieselError;
    use super::DieselErrorKind;
    use super::Error;
    use super::ErrorHandler;
    use super::InternalContext;
    use super::LeaseUpdateError;
    use super::ResourceType;
    use super::TransactionError;
    use assert_matches::assert_matches;

    #[test]
    fn test_internal_context_prefixes_internal_errors_only() {
        let error: Result<(), Error> =
            Err(Error::internal_error("two default domains"));
        assert_eq!(
            error.internal_context("loading domain").unwrap_err(),
            Error::InternalError {
                internal_message: "loading domain: two default domains"
                    .to_string()
            }
        );

        let error = Error::not_found(ResourceType::Subnet, 7);
        assert_eq!(error.clone().internal_context("ignored"), error);
        assert_eq!(
            error.to_string(),
            "Object (of type subnet) not found: 7"
        );
    }

    #[test]
    fn test_diesel_errors() {
        let error = public_error_from_diesel(
            DieselError::NotFound,
            ErrorHandler::NotFound(ResourceType::Node, "laptop"),
        );
        assert_eq!(error, Error::not_found(ResourceType::Node, "laptop"));

        // Without a handler that expects it, a missing row is a bug.
        let error =
            public_error_from_diesel(DieselError::NotFound, ErrorHandler::Server);
        assert_matches!(error, Error::InternalError { .. });

        let conflict = || {
            DieselError::DatabaseError(
                DieselErrorKind::UniqueViolation,
                Box::new(String::from("duplicate key value")),
            )
        };
        assert_eq!(
            public_error_from_diesel(
                conflict(),
                ErrorHandler::Conflict(ResourceType::Vlan, "10"),
            ),
            Error::already_exists(ResourceType::Vlan, "10")
        );
        let error = public_error_from_diesel(conflict(), ErrorHandler::Server);
        assert_matches!(
            error,
            Error::InternalError { ref internal_message }
                if internal_message.contains("UniqueViolation")
                    && internal_message.contains("duplicate key value")
        );
    }

    #[test]
    fn test_transaction_errors() {
        let serialization = || {
            DieselError::DatabaseError(
                DieselErrorKind::SerializationFailure,
                Box::new(String::from("could not serialize access")),
            )
        };
        let error = TransactionError::from_diesel(
            serialization(),
            ErrorHandler::Conflict(ResourceType::Node, "laptop"),
        );
        assert!(error.retryable());
        assert!(TransactionError::from(serialization()).retryable());

        let error = TransactionError::from(Error::internal_error("nope"));
        assert!(!error.retryable());
        assert_eq!(Error::from(error), Error::internal_error("nope"));

        let error = TransactionError::from(DieselError::NotFound);
        assert!(!error.retryable());
        assert_matches!(Error::from(error), Error::InternalError { .. });
    }

    #[test]
    fn test_lease_update_error_displays_bare_message() {
        let error = Error::from(LeaseUpdateError::new("bad action"));
        assert_eq!(error.to_string(), "bad action");
    }
}
