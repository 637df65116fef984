//! Entry point for obtaining broadcasters and listeners.
//!
//! `MessagingClient` maps each `TransportMode` to its transport and composes
//! relay and multicast pipelines on request. One client owns the process's
//! in-process hub and, when configured, its cloud transport.
//!
//! # Example
//!
//! ```ignore
//! use crossbus::{BusConfig, MessagingClient, TransportMode};
//!
//! let client = MessagingClient::builder(BusConfig::load(None)?).build();
//! let listener = client.listener(TransportMode::InProcess).await?;
//! listener.register_channel("orders").await?;
//!
//! let broadcaster = client.broadcaster(TransportMode::InProcess, false)?;
//! broadcaster.send("orders", "created:42").await?;
//! ```

use std::sync::Arc;

use tracing::{debug, info};

use crate::bus::cloud::{CloudTransport, QueueFacade};
use crate::bus::{
    Broadcaster, BusError, Listener, LocalHub, MulticastBroadcaster, RelayBroadcaster,
    RelayListener, RelayOrigin, Result, TransportMode,
};
use crate::config::BusConfig;
use crate::identity::{IdentityProvider, MachineIdentity};

/// Builder for `MessagingClient`.
pub struct MessagingClientBuilder {
    config: BusConfig,
    machine: Option<MachineIdentity>,
    cloud: Option<Arc<dyn QueueFacade>>,
}

impl MessagingClientBuilder {
    /// Back `RemoteNetwork` with a queue provider.
    pub fn with_cloud(mut self, facade: Arc<dyn QueueFacade>) -> Self {
        self.cloud = Some(facade);
        self
    }

    /// Use a fixed machine identity instead of detecting one.
    pub fn with_machine(mut self, machine: MachineIdentity) -> Self {
        self.machine = Some(machine);
        self
    }

    /// Connect the AWS provider when `cloud.enabled` is set.
    #[cfg(feature = "sns-sqs")]
    pub async fn with_aws(self) -> Self {
        if !self.config.cloud.enabled {
            return self;
        }
        let facade = crate::bus::cloud::AwsQueueFacade::new(self.config.cloud.clone()).await;
        self.with_cloud(Arc::new(facade))
    }

    pub fn build(self) -> MessagingClient {
        let machine = self
            .machine
            .unwrap_or_else(|| MachineIdentity::detect(self.config.machine_name.as_deref()));
        let config = Arc::new(self.config);
        let cloud = self
            .cloud
            .map(|facade| CloudTransport::new(facade, config.clone(), machine.clone()));

        info!(
            machine = %machine.unique_id(),
            namespace = %config.namespace,
            cloud = cloud.is_some(),
            "Messaging client ready"
        );

        MessagingClient {
            config,
            origin: RelayOrigin::new(machine.unique_id()),
            machine,
            local: LocalHub::new(),
            cloud,
        }
    }
}

/// Resolves transport modes to broadcasters and listeners.
pub struct MessagingClient {
    config: Arc<BusConfig>,
    machine: MachineIdentity,
    /// Stamped on relayed sends; its process id keeps this client from
    /// hearing its own relays.
    origin: RelayOrigin,
    local: LocalHub,
    cloud: Option<CloudTransport>,
}

impl MessagingClient {
    pub fn builder(config: BusConfig) -> MessagingClientBuilder {
        MessagingClientBuilder {
            config,
            machine: None,
            cloud: None,
        }
    }

    pub fn machine_name(&self) -> &str {
        self.machine.unique_id()
    }

    pub fn relay_origin(&self) -> &RelayOrigin {
        &self.origin
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// The in-process hub shared by every `InProcess` transport of this client.
    pub fn local_hub(&self) -> &LocalHub {
        &self.local
    }

    pub fn cloud(&self) -> Option<&CloudTransport> {
        self.cloud.as_ref()
    }

    fn cloud_transport(&self) -> Result<&CloudTransport> {
        self.cloud.as_ref().ok_or_else(|| {
            BusError::NotSupported(format!(
                "no transport registered for mode {}",
                TransportMode::RemoteNetwork
            ))
        })
    }

    fn plain_broadcaster(&self, mode: TransportMode) -> Result<Arc<dyn Broadcaster>> {
        match mode {
            TransportMode::InProcess => Ok(Arc::new(self.local.broadcaster())),
            TransportMode::RemoteNetwork => Ok(Arc::new(self.cloud_transport()?.broadcaster())),
        }
    }

    /// Broadcaster for `mode`.
    ///
    /// With `propagate_network`, sends on a non-network mode are also relayed
    /// to other machines; this requires a live `RemoteNetwork` transport.
    pub fn broadcaster(
        &self,
        mode: TransportMode,
        propagate_network: bool,
    ) -> Result<Arc<dyn Broadcaster>> {
        let local = self.plain_broadcaster(mode)?;
        if !propagate_network || mode == TransportMode::RemoteNetwork {
            return Ok(local);
        }

        let remote = match self.plain_broadcaster(TransportMode::RemoteNetwork) {
            Ok(remote) if remote.is_alive() => remote,
            _ => {
                return Err(BusError::Configuration(format!(
                    "network propagation for {} requires a live {} transport",
                    mode,
                    TransportMode::RemoteNetwork
                )))
            }
        };

        debug!(mode = %mode, "Relaying broadcaster to network");
        Ok(Arc::new(RelayBroadcaster::new(
            local,
            remote,
            self.origin.clone(),
            mode,
        )))
    }

    /// Listener for `mode`.
    ///
    /// Non-network modes are wrapped in a relay listener when a live
    /// `RemoteNetwork` transport is available at this point.
    pub async fn listener(&self, mode: TransportMode) -> Result<Arc<dyn Listener>> {
        match mode {
            TransportMode::RemoteNetwork => {
                Ok(Arc::new(self.cloud_transport()?.listener(false)))
            }
            TransportMode::InProcess => {
                let local: Arc<dyn Listener> = Arc::new(self.local.listener());
                match self.cloud.as_ref().filter(|cloud| cloud.is_configured()) {
                    Some(cloud) => {
                        let remote = cloud.listener(self.config.relay.long_lived_queues);
                        debug!(mode = %mode, "Relaying listener from network");
                        Ok(Arc::new(
                            RelayListener::new(
                                local,
                                Arc::new(remote),
                                self.origin.clone(),
                                mode,
                            )
                            .await,
                        ))
                    }
                    None => Ok(local),
                }
            }
        }
    }

    /// One broadcaster sending through the plain transport of every mode.
    pub fn multicast(&self, modes: &[TransportMode]) -> Result<MulticastBroadcaster> {
        let inner = modes
            .iter()
            .map(|mode| self.plain_broadcaster(*mode))
            .collect::<Result<Vec<_>>>()?;
        Ok(MulticastBroadcaster::new(inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::cloud::MemoryQueueFacade;

    fn in_process_client() -> MessagingClient {
        MessagingClient::builder(BusConfig::for_test())
            .with_machine(MachineIdentity::new("host-1"))
            .build()
    }

    fn cloud_client(facade: Arc<MemoryQueueFacade>) -> MessagingClient {
        MessagingClient::builder(BusConfig::for_test())
            .with_machine(MachineIdentity::new("host-1"))
            .with_cloud(facade)
            .build()
    }

    #[tokio::test]
    async fn test_remote_without_cloud_not_supported() {
        let client = in_process_client();
        assert!(matches!(
            client.broadcaster(TransportMode::RemoteNetwork, false),
            Err(BusError::NotSupported(_))
        ));
        assert!(matches!(
            client.listener(TransportMode::RemoteNetwork).await,
            Err(BusError::NotSupported(_))
        ));
        assert!(matches!(
            client.multicast(&[TransportMode::InProcess, TransportMode::RemoteNetwork]),
            Err(BusError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_propagation_requires_live_remote() {
        let client = in_process_client();
        assert!(matches!(
            client.broadcaster(TransportMode::InProcess, true),
            Err(BusError::Configuration(_))
        ));

        let facade = Arc::new(MemoryQueueFacade::new());
        facade.set_configured(false);
        let client = cloud_client(facade);
        assert!(matches!(
            client.broadcaster(TransportMode::InProcess, true),
            Err(BusError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_plain_in_process_round_trip() {
        let client = in_process_client();
        let listener = client.listener(TransportMode::InProcess).await.unwrap();
        listener.register_channel("orders").await.unwrap();

        let broadcaster = client.broadcaster(TransportMode::InProcess, false).unwrap();
        assert!(broadcaster.is_alive());
        broadcaster.send("orders", "created:42").await.unwrap();
        listener.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_mode_is_never_relayed() {
        let facade = Arc::new(MemoryQueueFacade::new());
        let client = cloud_client(facade.clone());

        let broadcaster = client
            .broadcaster(TransportMode::RemoteNetwork, true)
            .unwrap();
        broadcaster.send("orders", "created:42").await.unwrap();

        // A relay would have published a second message on the relay topic
        assert_eq!(
            facade.calls(crate::bus::cloud::FacadeOp::Publish),
            1
        );
    }

    #[tokio::test]
    async fn test_multicast_over_modes() {
        let facade = Arc::new(MemoryQueueFacade::new());
        let client = cloud_client(facade.clone());

        let multicast = client
            .multicast(&[TransportMode::InProcess, TransportMode::RemoteNetwork])
            .unwrap();
        assert_eq!(multicast.len(), 2);
        multicast.send("orders", "created:42").await.unwrap();
        assert_eq!(
            facade.calls(crate::bus::cloud::FacadeOp::Publish),
            1
        );
    }

    #[test]
    fn test_machine_name_from_config() {
        let config = BusConfig {
            machine_name: Some("configured-host".to_string()),
            ..BusConfig::for_test()
        };
        let client = MessagingClient::builder(config).build();
        assert_eq!(client.machine_name(), "configured-host");
        assert_eq!(client.relay_origin().machine_name(), "configured-host");
    }

    #[test]
    fn test_clients_on_one_host_have_distinct_origins() {
        let first = in_process_client();
        let second = in_process_client();
        assert_eq!(
            first.relay_origin().machine_name(),
            second.relay_origin().machine_name()
        );
        assert_ne!(
            first.relay_origin().process_id(),
            second.relay_origin().process_id()
        );
    }
}
