//! CloudGateway - cloud side of the edge service mesh

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cloudgateway::allocator::VirtualPresenceAllocator;
use cloudgateway::bootstrap::{self, BootstrapState};
use cloudgateway::config::{CloudGatewayConfig, KubeApiConfig, DEFAULT_CONFIG_PATH};
use cloudgateway::controller::{
    exposes_for_policy, exposes_for_server, exposes_for_service, expose_error_policy,
    gateway_error_policy, holders_for_gateway, reconcile_expose, reconcile_gateway,
    reconcile_server, reconcile_service, server_error_policy, service_error_policy, Context,
    FIELD_MANAGER,
};
use cloudgateway::crd::{
    all_crds, crd_manifests, EGateway, EPolicy, EServer, EService, ServiceExpose, VirtualPresence,
};
use cloudgateway::dataplane::{CloudMeshHandler, DirectiveSink, Programmer, TunnelDispatcher};
use cloudgateway::forwarder::{self, ForwarderState, StoreResolver};
use cloudgateway::hub::{self, CloudHub, GroupBus, HubSettings};
use cloudgateway::message::{MessageQueue, GROUP_CLOUDMESH};
use cloudgateway::pki::store::run_token_refresh;
use cloudgateway::pki::{prepare_all_certs, HubCredentials, KubeSecretStore, SecretStore};
use cloudgateway::retry::{retry_with_backoff, RetryConfig};
use cloudgateway::tap::{self, StreamState, TapDevice};
use cloudgateway::tls::{self, ClientAuth};
use cloudgateway::Error;

/// ALPN of the HTTP/1.1 listeners carrying WebSocket upgrades
const HTTP1_ALPN: &[&[u8]] = &[b"http/1.1"];

/// How long listeners and controllers get to stop after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// CloudGateway - connects edge sites to the cloud cluster
#[derive(Parser, Debug)]
#[command(name = "cloudgateway", version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, env = "CLOUDGATEWAY_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Print the default configuration and exit
    #[arg(long = "defaultconfig")]
    default_config: bool,
}

type Task = (&'static str, Result<(), Error>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - aws-lc-rs backs every listener and the CA
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The gateway cannot serve TLS without it.",
            e
        );
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_manifests()?);
        return Ok(());
    }
    if cli.default_config {
        println!("{}", CloudGatewayConfig::default().to_yaml()?);
        return Ok(());
    }

    let config = CloudGatewayConfig::load(&cli.config)
        .map_err(|e| anyhow::anyhow!("Failed to load {:?}: {}", cli.config, e))?;
    run(config).await
}

/// Build a client from the configured kubeconfig, honouring a `master` override
async fn kube_client(config: &KubeApiConfig) -> anyhow::Result<Client> {
    let mut client_config = if config.kube_config.is_empty() {
        kube::Config::infer()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to infer Kubernetes config: {}", e))?
    } else {
        let kubeconfig = Kubeconfig::read_from(&config.kube_config)
            .map_err(|e| anyhow::anyhow!("Failed to read kubeconfig {}: {}", config.kube_config, e))?;
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to build Kubernetes config: {}", e))?
    };
    if !config.master.is_empty() {
        client_config.cluster_url = config
            .master
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid master URL {}: {}", config.master, e))?;
    }
    Client::try_from(client_config)
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))
}

/// Install or update every CloudGateway CRD with server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd.name_any();
        let patch = Patch::Apply(&crd);
        tracing::info!(crd = %name, "Installing CRD");
        retry_with_backoff(&RetryConfig::with_max_attempts(10), "install CRD", || {
            crds.patch(&name, &params, &patch)
        })
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("All CloudGateway CRDs installed/updated");
    Ok(())
}

/// Rebuild the allocator from stored gateways and virtual presences
async fn rebuild_allocator(client: &Client) -> anyhow::Result<VirtualPresenceAllocator> {
    let gateways: Api<EGateway> = Api::all(client.clone());
    let presences: Api<VirtualPresence> = Api::all(client.clone());
    let retry = RetryConfig::with_max_attempts(10);
    let params = ListParams::default();

    let gateways = retry_with_backoff(&retry, "list gateways", || {
        gateways.list(&params)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to list EGateways: {}", e))?;
    let presences = retry_with_backoff(&retry, "list virtual presences", || {
        presences.list(&params)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to list VirtualPresences: {}", e))?;

    let allocator = VirtualPresenceAllocator::rebuild(&gateways.items, &presences.items);
    tracing::info!(
        gateways = gateways.items.len(),
        presences = presences.items.len(),
        "Virtual presence allocator rebuilt"
    );
    Ok(allocator)
}

/// Start a reflector for `api` and return its store
fn reflect<K>(api: Api<K>, tasks: &mut JoinSet<Task>, cancel: CancellationToken) -> Store<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let (store, writer) = reflector::store();
    let stream = watcher::watcher(api, WatcherConfig::default())
        .default_backoff()
        .reflect(writer)
        .for_each(|event| async move {
            if let Err(e) = event {
                tracing::warn!(error = %e, "Watch stream error");
            }
        });
    tasks.spawn(until_cancelled("reflector", stream, cancel));
    store
}

async fn until_cancelled<F>(name: &'static str, fut: F, cancel: CancellationToken) -> Task
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = fut => tracing::info!(task = name, "Task completed"),
        _ = cancel.cancelled() => {}
    }
    (name, Ok(()))
}

async fn labelled<F>(name: &'static str, fut: F) -> Task
where
    F: Future<Output = Result<(), Error>>,
{
    (name, fut.await)
}

/// Spawn the ServiceExpose, EService, EServer and EGateway controllers
fn spawn_controllers(
    client: &Client,
    ctx: Arc<Context>,
    threadiness: u16,
    tasks: &mut JoinSet<Task>,
    cancel: &CancellationToken,
) {
    let controller_config = ControllerConfig::default().concurrency(threadiness);

    tracing::info!(threadiness, "Starting CloudGateway controllers...");
    tracing::info!("  - ServiceExpose controller");
    tracing::info!("  - EService controller");
    tracing::info!("  - EServer controller");
    tracing::info!("  - EGateway controller");

    let expose_controller = Controller::new(Api::<ServiceExpose>::all(client.clone()), WatcherConfig::default())
        .with_config(controller_config.clone());
    let exposes = expose_controller.store();
    let (by_service, by_policy, by_server) = (exposes.clone(), exposes.clone(), exposes);
    let expose_controller = expose_controller
        .watches(
            Api::<EService>::all(client.clone()),
            WatcherConfig::default(),
            move |service| exposes_for_service(&by_service.state(), &service),
        )
        .watches(
            Api::<EPolicy>::all(client.clone()),
            WatcherConfig::default(),
            move |policy| exposes_for_policy(&by_policy.state(), &policy),
        )
        .watches(
            Api::<EServer>::all(client.clone()),
            WatcherConfig::default(),
            move |server| exposes_for_server(&by_server.state(), &server),
        )
        .run(reconcile_expose, expose_error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "ServiceExpose reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "ServiceExpose reconciliation error"),
            }
        });

    let service_controller = Controller::new(Api::<EService>::all(client.clone()), WatcherConfig::default())
        .with_config(controller_config.clone());
    let services = service_controller.store();
    let service_controller = service_controller
        .watches(
            Api::<EGateway>::all(client.clone()),
            WatcherConfig::default(),
            move |gateway| holders_for_gateway(&services.state(), &gateway),
        )
        .run(reconcile_service, service_error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "EService reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "EService reconciliation error"),
            }
        });

    let server_controller = Controller::new(Api::<EServer>::all(client.clone()), WatcherConfig::default())
        .with_config(controller_config.clone());
    let servers = server_controller.store();
    let server_controller = server_controller
        .watches(
            Api::<EGateway>::all(client.clone()),
            WatcherConfig::default(),
            move |gateway| holders_for_gateway(&servers.state(), &gateway),
        )
        .run(reconcile_server, server_error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "EServer reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "EServer reconciliation error"),
            }
        });

    let gateway_controller = Controller::new(Api::<EGateway>::all(client.clone()), WatcherConfig::default())
        .with_config(controller_config)
        .run(reconcile_gateway, gateway_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "EGateway reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "EGateway reconciliation error"),
            }
        });

    tasks.spawn(until_cancelled("serviceexpose controller", expose_controller, cancel.clone()));
    tasks.spawn(until_cancelled("eservice controller", service_controller, cancel.clone()));
    tasks.spawn(until_cancelled("eserver controller", server_controller, cancel.clone()));
    tasks.spawn(until_cancelled("egateway controller", gateway_controller, cancel.clone()));
}

/// Spawn the bootstrap, WebSocket and QUIC listeners
fn spawn_hub_listeners(
    config: &CloudGatewayConfig,
    hub: &Arc<CloudHub>,
    credentials: &Arc<HubCredentials>,
    tasks: &mut JoinSet<Task>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let hub_config = &config.modules.cloud_hub;

    if hub_config.https.enable {
        let state = Arc::new(BootstrapState::new(
            credentials.clone(),
            hub_config.edge_cert_signing_duration,
        ));
        let tls = tls::server_config(credentials, ClientAuth::Deferred, bootstrap::ALPN)?;
        tasks.spawn(labelled(
            "bootstrap listener",
            bootstrap::serve(state, hub_config.https.socket_addr(), tls, cancel.clone()),
        ));
    }

    if hub_config.websocket.enable {
        let tls = tls::server_config(credentials, ClientAuth::Required, HTTP1_ALPN)?;
        tasks.spawn(labelled(
            "websocket listener",
            hub::websocket::serve(hub.clone(), hub_config.websocket.socket_addr(), tls, cancel.clone()),
        ));
    }

    if hub_config.quic.enable {
        let tls = tls::server_config(credentials, ClientAuth::Required, &[])?;
        let quic = hub::quic::server_config(tls, hub_config.quic.max_incoming_streams)?;
        tasks.spawn(labelled(
            "quic listener",
            hub::quic::serve(hub.clone(), hub_config.quic.socket_addr(), quic, cancel.clone()),
        ));
    }

    Ok(())
}

/// Run the gateway until a shutdown signal or a fatal listener error
async fn run(config: CloudGatewayConfig) -> anyhow::Result<()> {
    tracing::info!("CloudGateway starting...");
    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<Task> = JoinSet::new();
    let modules = &config.modules;

    let client = kube_client(&config.kube_api_config).await?;
    ensure_crds_installed(&client).await?;

    // Credentials are shared read-only by every listener
    let hub_config = &modules.cloud_hub;
    let store: Arc<dyn SecretStore> = Arc::new(KubeSecretStore::new(client.clone()));
    let credentials = Arc::new(
        prepare_all_certs(hub_config, store.as_ref())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to prepare certificates: {}", e))?,
    );
    tracing::info!("CA and server certificates ready");

    tasks.spawn(until_cancelled(
        "token refresh",
        run_token_refresh(
            store,
            hub_config.secret_namespace.clone(),
            credentials.clone(),
            hub_config.token_refresh_interval(),
            cancel.clone(),
        ),
        cancel.clone(),
    ));

    // Local data plane, also fed by edges through the cloudmesh group
    let programmer = Arc::new(if modules.cloud_mesh.dry_run {
        tracing::info!("Data plane in dry-run mode");
        Programmer::dry_run()
    } else {
        Programmer::system()
    });
    let cloud_site = modules.service_expose.cloud_site_name.clone();

    let bus = Arc::new(GroupBus::new());
    bus.register(
        GROUP_CLOUDMESH,
        Arc::new(CloudMeshHandler::new(cloud_site.clone(), programmer.clone())),
    );
    let hub = Arc::new(CloudHub::new(
        HubSettings::from(hub_config),
        Arc::new(MessageQueue::new()),
        bus,
        cancel.clone(),
    ));
    tasks.spawn(until_cancelled(
        "queue purge",
        hub.clone()
            .run_queue_purge(hub_config.node_queue_grace_period(), cancel.clone()),
        cancel.clone(),
    ));

    if hub_config.enable {
        spawn_hub_listeners(&config, &hub, &credentials, &mut tasks, &cancel)?;
    }

    if modules.service_expose.enable {
        let allocator = Arc::new(rebuild_allocator(&client).await?);
        let sink: Arc<dyn DirectiveSink> = Arc::new(TunnelDispatcher::new(
            cloud_site,
            programmer,
            hub.clone(),
        ));
        let ctx = Arc::new(
            Context::builder(client.clone(), sink)
                .allocator(allocator)
                .tap_ip(modules.cloud_mesh.tap_ip)
                .build(),
        );
        spawn_controllers(
            &client,
            ctx,
            modules.service_expose.threadiness,
            &mut tasks,
            &cancel,
        );
    }

    if modules.cloud_mesh.enable && modules.cloud_mesh.listener.enable {
        let device = TapDevice::open(&modules.cloud_mesh)
            .map_err(|e| anyhow::anyhow!("Failed to create TAP device: {}", e))?;
        let tls = tls::server_config(&credentials, ClientAuth::Required, HTTP1_ALPN)?;
        let state = Arc::new(StreamState::new(device, cancel.clone()));
        tasks.spawn(labelled(
            "tap stream listener",
            tap::serve(state, modules.cloud_mesh.listener.socket_addr(), tls),
        ));
    }

    if modules.cloud_service.enable {
        let services = reflect(Api::<EService>::all(client.clone()), &mut tasks, cancel.clone());
        let exposes = reflect(Api::<ServiceExpose>::all(client.clone()), &mut tasks, cancel.clone());
        let state = Arc::new(ForwarderState::new(
            Arc::new(StoreResolver::new(services, exposes)),
            hub.clone(),
        ));
        tasks.spawn(labelled(
            "http forwarder",
            forwarder::serve(state, modules.cloud_service.port, cancel.clone()),
        ));
    }

    tracing::info!("CloudGateway started");

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::warn!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            Ok(())
        }
        Some(joined) = tasks.join_next() => match joined {
            Ok((name, Err(e))) => Err(anyhow::anyhow!("{} failed: {}", name, e)),
            Ok((name, Ok(()))) => Err(anyhow::anyhow!("{} stopped unexpectedly", name)),
            Err(e) => Err(anyhow::anyhow!("task panicked: {}", e)),
        },
    };

    cancel.cancel();
    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            if let Ok((name, Err(e))) = joined {
                tracing::warn!(task = name, error = %e, "Task failed during shutdown");
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!("Tasks still running after grace period, aborting");
        tasks.abort_all();
    }

    tracing::info!("CloudGateway shutting down");
    outcome
}
