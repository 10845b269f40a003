//! Wiring of stores, services, broker channel and background jobs
//!
//! [`DiscoveryRuntime::new`] builds every component around a caller-supplied
//! connector and fleet notifier; [`DiscoveryRuntime::from_config`] is the
//! production entry point using MQTT. Nothing touches the broker until
//! [`start`](DiscoveryRuntime::start) is called.

use crate::config::{ConfigError, DiscoveryConfig};
use crate::fleet::{FleetNotifier, LoggingFleetRegistry};
use crate::model::{Device, RegistrationRequest};
use crate::monitor::{
    DeviceMetricsMonitor, DeviceStatusMonitor, LifecycleResponseMonitor, MonitorDispatcher,
    TopicHandler,
};
use crate::processing::correlator::CorrelatorSettings;
use crate::processing::reconciler::ReconcilerSettings;
use crate::processing::sweeper::SweeperSettings;
use crate::processing::{
    HealthSweeper, LifecycleRequestCoordinator, ResponseCorrelator, UnknownDeviceReconciler,
};
use crate::scheduler::TaskScheduler;
use crate::service::{DeviceService, RegistrationRequestService};
use crate::store::{DeviceStore, InMemoryStore, RequestStore};
use crate::transport::mqtt::MqttConnector;
use crate::transport::{
    AesGcmCipher, BrokerChannel, BrokerConnector, ChannelSettings, MessageCipher,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct DiscoveryRuntime {
    config: DiscoveryConfig,
    channel: Arc<BrokerChannel>,
    devices: DeviceService,
    requests: RegistrationRequestService,
    correlator: Arc<ResponseCorrelator>,
    coordinator: Arc<LifecycleRequestCoordinator>,
    reconciler: Arc<UnknownDeviceReconciler>,
    sweeper: Arc<HealthSweeper>,
    monitors: Vec<Arc<MonitorDispatcher>>,
    scheduler: TaskScheduler,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryRuntime {
    /// Production runtime: MQTT connector plus, if enabled, the logging fleet
    /// registry and AES-GCM message encryption
    ///
    /// Fails when encryption is enabled but its password is not available.
    pub fn from_config(config: DiscoveryConfig) -> Result<Self, ConfigError> {
        let cipher = AesGcmCipher::from_broker_config(&config.broker)?
            .map(|cipher| Arc::new(cipher) as Arc<dyn MessageCipher>);
        let connector = Arc::new(MqttConnector::new(config.broker.clone()));
        let fleet = if config.fleet.registration_enabled {
            FleetNotifier::new(Arc::new(LoggingFleetRegistry))
        } else {
            FleetNotifier::disabled()
        };
        Ok(Self::new(config, connector, fleet, cipher))
    }

    pub fn new(
        config: DiscoveryConfig,
        connector: Arc<dyn BrokerConnector>,
        fleet: FleetNotifier,
        cipher: Option<Arc<dyn MessageCipher>>,
    ) -> Self {
        let live_devices: Arc<DeviceStore> =
            Arc::new(InMemoryStore::<Device>::with_unique_ip_addresses());
        let archived_devices: Arc<DeviceStore> = Arc::new(InMemoryStore::<Device>::new());
        let live_requests: Arc<RequestStore> =
            Arc::new(InMemoryStore::<RegistrationRequest>::with_unique_ip_addresses());
        let archived_requests: Arc<RequestStore> =
            Arc::new(InMemoryStore::<RegistrationRequest>::new());

        let devices = DeviceService::new(live_devices.clone(), archived_devices, fleet);
        let requests =
            RegistrationRequestService::new(live_requests, archived_requests, live_devices);

        let channel = BrokerChannel::with_cipher(
            ChannelSettings::from_config(&config.broker),
            connector,
            cipher,
        );

        let correlator = Arc::new(ResponseCorrelator::new(
            requests.clone(),
            devices.clone(),
            channel.clone(),
            CorrelatorSettings::from_config(&config),
        ));
        let coordinator = Arc::new(LifecycleRequestCoordinator::new(
            devices.clone(),
            channel.clone(),
            config.topics.lifecycle_request.clone(),
        ));
        let reconciler = Arc::new(UnknownDeviceReconciler::new(
            requests.clone(),
            devices.clone(),
            channel.clone(),
            ReconcilerSettings::from_config(&config),
        ));
        let sweeper = Arc::new(HealthSweeper::new(
            devices.clone(),
            channel.clone(),
            SweeperSettings::from_config(&config),
        ));

        let handlers: Vec<Arc<dyn TopicHandler>> = vec![
            correlator.clone(),
            Arc::new(LifecycleResponseMonitor::new(
                devices.clone(),
                config.topics.lifecycle_response.clone(),
                config.archiving.immediately_archive_offboarded_devices,
            )),
            Arc::new(DeviceStatusMonitor::new(
                devices.clone(),
                config.topics.device_status.clone(),
            )),
            Arc::new(DeviceMetricsMonitor::new(
                devices.clone(),
                config.topics.device_metrics.clone(),
            )),
            reconciler.clone(),
        ];
        let monitors = handlers.into_iter().map(MonitorDispatcher::new).collect();

        Self {
            config,
            channel,
            devices,
            requests,
            correlator,
            coordinator,
            reconciler,
            sweeper,
            monitors,
            scheduler: TaskScheduler::new(),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn channel(&self) -> &Arc<BrokerChannel> {
        &self.channel
    }

    pub fn devices(&self) -> &DeviceService {
        &self.devices
    }

    pub fn requests(&self) -> &RegistrationRequestService {
        &self.requests
    }

    pub fn correlator(&self) -> &Arc<ResponseCorrelator> {
        &self.correlator
    }

    pub fn coordinator(&self) -> &Arc<LifecycleRequestCoordinator> {
        &self.coordinator
    }

    pub fn reconciler(&self) -> &Arc<UnknownDeviceReconciler> {
        &self.reconciler
    }

    pub fn sweeper(&self) -> &Arc<HealthSweeper> {
        &self.sweeper
    }

    /// Start the inbound dispatcher, the monitor subscriptions and the periodic jobs
    pub fn start(&self) {
        let handle = self.channel.start_dispatcher();
        if handle.is_none() {
            warn!("Discovery runtime already started");
            return;
        }
        *self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner) = handle;

        let broker = &self.config.broker;
        for monitor in &self.monitors {
            let monitor = monitor.clone();
            let channel = self.channel.clone();
            let retry_delay = broker.subscription_retry_delay();
            self.scheduler.schedule_once(
                "monitor_subscriptions",
                broker.subscription_startup_delay(),
                monitor.bootstrap(channel, retry_delay),
            );
        }

        let processing = &self.config.processing;
        if processing.enable_periodic_processing {
            let correlator = self.correlator.clone();
            self.scheduler.schedule_at_fixed_rate(
                "process_requests",
                processing.startup_delay(),
                processing.period(),
                move || {
                    let correlator = correlator.clone();
                    async move {
                        correlator.process_requests().await;
                    }
                },
            );
        } else {
            info!("Periodic registration request processing disabled");
        }

        let sweeper = self.sweeper.clone();
        self.scheduler.schedule_at_fixed_rate(
            "process_devices",
            processing.startup_delay(),
            self.config.health.period(),
            move || {
                let sweeper = sweeper.clone();
                async move {
                    sweeper.process_devices().await;
                }
            },
        );

        let reconciler = self.reconciler.clone();
        self.scheduler.schedule_with_fixed_delay(
            "reconcile_unknown_devices",
            processing.reconciliation_period(),
            processing.reconciliation_period(),
            move || {
                let reconciler = reconciler.clone();
                async move {
                    reconciler.reconcile().await;
                }
            },
        );

        let channel = self.channel.clone();
        self.scheduler.schedule_at_fixed_rate(
            "broker_health_check",
            broker.health_check_period(),
            broker.health_check_period(),
            move || {
                let channel = channel.clone();
                async move {
                    channel.health_check().await;
                }
            },
        );

        info!(
            broker = %broker.broker_url,
            monitors = self.monitors.len(),
            "Discovery runtime started"
        );
    }

    /// Stop the jobs, close the broker channel and wait for the dispatcher
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.channel.shutdown().await;

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dispatcher {
            handle.abort();
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                warn!("Inbound dispatcher did not stop in time");
            }
        }
        info!("Discovery runtime stopped");
    }
}
