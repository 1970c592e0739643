// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The region side of the region/rack RPC surface

use crate::config::Config;
use crate::config::RpcConfig;
use crate::registry::ConnectionRegistry;
use crate::registry::RackClient;
use crate::registry::RackConnection;
use crate::registry::RegistryError;
use region_db_queries::db::error::Error;
use region_db_queries::db::model::LeaseUpdateParams;
use region_db_queries::db::DataStore;
use region_db_queries::db::Pool;
use serde::Deserialize;
use serde::Serialize;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Name under which racks invoke [`RegionService::update_lease()`].
pub const UPDATE_LEASE_COMMAND: &str = "UpdateLease";

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct UpdateLeaseResponse {}

/// A failure reported back to the calling rack controller.
///
/// `error_code` is stable and meant for programmatic use; `message` is for
/// humans.
#[derive(Clone, Debug, Deserialize, Error, PartialEq, Eq, Serialize)]
#[error("{error_code}: {message}")]
pub struct RpcFault {
    pub error_code: String,
    pub message: String,
}

impl RpcFault {
    pub const LEASE_UPDATE_ERROR: &'static str = "LeaseUpdateError";
    pub const INVALID_ARGUMENTS: &'static str = "InvalidArguments";
    pub const UNHANDLED_COMMAND: &'static str = "UnhandledCommand";
    pub const INTERNAL_ERROR: &'static str = "InternalError";

    pub fn new(error_code: &str, message: impl Into<String>) -> RpcFault {
        RpcFault { error_code: error_code.to_string(), message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> RpcFault {
        RpcFault::new(RpcFault::INTERNAL_ERROR, message)
    }
}

impl From<Error> for RpcFault {
    /// Converts a datastore error into the fault a rack sees.  Only lease
    /// validation failures are the caller's problem; everything else is
    /// reported as an internal error.
    fn from(error: Error) -> RpcFault {
        match error {
            Error::LeaseUpdate(e) => {
                RpcFault::new(RpcFault::LEASE_UPDATE_ERROR, e.0)
            }
            error @ (Error::Lock(_)
            | Error::ObjectNotFound { .. }
            | Error::ObjectAlreadyExists { .. }
            | Error::InvalidRequest { .. }
            | Error::TransactionConflict { .. }
            | Error::ServiceUnavailable { .. }
            | Error::InternalError { .. }) => {
                RpcFault::internal(error.to_string())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to initialize logger")]
    Logger(#[source] std::io::Error),
    #[error("failed to initialize region database")]
    Database(#[source] Error),
}

/// Serves the RPC calls rack controllers make to the region, and hands out
/// the rack connections the region uses to call back.
pub struct RegionService<C> {
    log: Logger,
    datastore: Arc<DataStore>,
    registry: Arc<ConnectionRegistry<C>>,
    client_timeout: Duration,
}

impl<C: RackConnection> RegionService<C> {
    pub fn new(log: &Logger, datastore: Arc<DataStore>, config: &RpcConfig) -> Self {
        let log = log.new(o!("component" => "RegionService"));
        let registry = Arc::new(ConnectionRegistry::new(&log));
        RegionService {
            log,
            datastore,
            registry,
            client_timeout: config.client_timeout(),
        }
    }

    /// Builds the logger and the region database described by `config`, then
    /// the service on top of them.
    pub async fn start(config: &Config) -> Result<Self, StartError> {
        let log = config.log.to_logger("region").map_err(StartError::Logger)?;
        let pool = Pool::new(&log, &config.database);
        let datastore = Arc::new(DataStore::new(
            &log,
            pool,
            config.database.clone(),
            config.dns.clone(),
        ));
        datastore.initialize().await.map_err(StartError::Database)?;
        info!(
            log,
            "region service ready";
            "client_timeout" => ?config.rpc.client_timeout(),
        );
        Ok(RegionService::new(&log, datastore, &config.rpc))
    }

    pub fn datastore(&self) -> &Arc<DataStore> {
        &self.datastore
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<C>> {
        &self.registry
    }

    /// Applies one DHCP lease event reported by a rack controller.
    pub async fn update_lease(
        &self,
        params: LeaseUpdateParams,
    ) -> Result<UpdateLeaseResponse, RpcFault> {
        let action = params.action.clone();
        let mac = params.mac.clone();
        let ip = params.ip.clone();

        let result = self.datastore.update_lease(params).await;

        match result {
            Ok(()) => Ok(UpdateLeaseResponse {}),
            Err(error @ Error::LeaseUpdate(_)) => {
                info!(
                    self.log,
                    "rejected lease update";
                    "action" => action,
                    "mac" => mac,
                    "ip" => ip,
                    "error" => %error,
                );
                Err(error.into())
            }
            Err(error) => {
                error!(
                    self.log,
                    "lease update failed";
                    "action" => action,
                    "mac" => mac,
                    "ip" => ip,
                    "error" => %error,
                );
                Err(error.into())
            }
        }
    }

    /// Decodes a command as it arrives off the wire and runs it.
    pub async fn dispatch(
        &self,
        command: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, RpcFault> {
        match command {
            UPDATE_LEASE_COMMAND => {
                let params: LeaseUpdateParams =
                    serde_json::from_value(arguments).map_err(|e| {
                        RpcFault::new(
                            RpcFault::INVALID_ARGUMENTS,
                            format!("malformed {command} arguments: {e}"),
                        )
                    })?;
                let response = self.update_lease(params).await?;
                serde_json::to_value(response).map_err(|e| {
                    RpcFault::internal(format!(
                        "failed to encode {command} response: {e}"
                    ))
                })
            }
            _ => {
                warn!(self.log, "unhandled command"; "command" => command);
                Err(RpcFault::new(
                    RpcFault::UNHANDLED_COMMAND,
                    format!("unhandled command: {command}"),
                ))
            }
        }
    }

    /// Called by the transport once a rack controller connection is up.
    pub fn register_connection(
        &self,
        ident: &str,
        connection: C,
    ) -> Result<(), RegistryError> {
        self.registry.register(ident, connection)
    }

    /// Called by the transport when a rack controller connection is lost.
    pub fn unregister_connection(&self, ident: &str, connection: &C) -> bool {
        self.registry.unregister(ident, connection)
    }

    /// Returns a connection to rack `ident`, waiting up to `timeout` (or the
    /// configured client timeout) for one.
    pub async fn get_client_for(
        &self,
        ident: &str,
        timeout: Option<Duration>,
    ) -> Result<RackClient<C>, RegistryError> {
        self.registry.get(ident, timeout.unwrap_or(self.client_timeout)).await
    }

    /// Returns a connection to whichever of `identifiers` is, or first
    /// becomes, available.
    pub async fn get_client_from_identifiers<I, S>(
        &self,
        identifiers: I,
        timeout: Option<Duration>,
    ) -> Result<RackClient<C>, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.registry
            .get_any_of(identifiers, timeout.unwrap_or(self.client_timeout))
            .await
    }

    pub fn get_all_clients(&self) -> Vec<RackClient<C>> {
        self.registry.get_all()
    }

    pub fn get_random_client(&self) -> Result<RackClient<C>, RegistryError> {
        self.registry.get_random()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use region_db_queries::db::error::LeaseUpdateError;

    #[test]
    fn test_fault_codes() {
        let fault = RpcFault::from(Error::from(LeaseUpdateError::new(
            "Invalid MAC address: zz",
        )));
        assert_eq!(
            fault,
            RpcFault {
                error_code: "LeaseUpdateError".to_string(),
                message: "Invalid MAC address: zz".to_string(),
            }
        );

        let fault = RpcFault::from(Error::TransactionConflict {
            name: "update_lease".to_string(),
            attempts: 10,
        });
        assert_eq!(fault.error_code, RpcFault::INTERNAL_ERROR);
        assert!(fault.message.contains("update_lease"));

        let fault = RpcFault::from(Error::ServiceUnavailable {
            internal_message: "connection refused".to_string(),
        });
        assert_eq!(fault.error_code, RpcFault::INTERNAL_ERROR);
        assert_eq!(fault.message, "Service Unavailable: connection refused");

        let fault = RpcFault::from(Error::internal_error("broken"));
        assert_eq!(fault.error_code, "InternalError");
        assert_eq!(fault.message, "Internal Error: broken");
    }

    #[test]
    fn test_fault_wire_format() {
        let fault = RpcFault::new(RpcFault::LEASE_UPDATE_ERROR, "nope");
        assert_eq!(
            serde_json::to_value(&fault).unwrap(),
            serde_json::json!({
                "error_code": "LeaseUpdateError",
                "message": "nope",
            })
        );
        assert_eq!(
            serde_json::to_value(UpdateLeaseResponse {}).unwrap(),
            serde_json::json!({})
        );
    }
}
