use std::{io::ErrorKind, path::PathBuf};

use anyhow::Context;
use tracing::{info, warn};

use provision_common::{
    Credentials, LedState, ModeController, ModeError, ProvisioningResult, RadioServices,
    RuntimeConfig, StatusLed,
};

use crate::net::{CaptiveDns, ProvisioningDriver};

struct ProvisionStore {
    runtime_path: PathBuf,
}

impl ProvisionStore {
    fn new() -> Self {
        let data_dir = std::env::var("PROVISION_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.provision"));

        Self {
            runtime_path: data_dir.join("runtime.json"),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(&self.runtime_path).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        if let Some(parent) = self.runtime_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(&self.runtime_path, payload).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ConsoleLed {
    on: bool,
}

impl StatusLed for ConsoleLed {
    fn is_on(&self) -> bool {
        self.on
    }

    fn set(&mut self, on: bool) {
        if on != self.on {
            info!(led = LedState::from_bool(on).as_str(), "status led changed");
        }
        self.on = on;
    }
}

/// A workstation has no radio to reconfigure, so each step is only logged.
struct HostRadio {
    connect_timeout_ms: u64,
    dns: Option<CaptiveDns>,
}

impl RadioServices for HostRadio {
    fn stop_helpers(&mut self) -> Result<(), ModeError> {
        if let Some(dns) = self.dns.take() {
            dns.stop();
        }
        info!("provisioning helpers stopped");
        Ok(())
    }

    fn disable_access_point(&mut self) -> Result<(), ModeError> {
        info!("access point disabled");
        Ok(())
    }

    fn connect_station(&mut self, credentials: &Credentials) -> Result<(), ModeError> {
        info!(
            ssid = credentials.ssid(),
            timeout_ms = self.connect_timeout_ms,
            "station mode requested"
        );
        Ok(())
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ProvisionStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    if let Some(port) = std::env::var("PROVISION_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.server.port = port;
    }
    if let Some(port) = std::env::var("PROVISION_DNS_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.server.dns_port = port;
    }
    runtime.sanitize();

    let driver = ProvisioningDriver::open(&runtime.server, ConsoleLed::default())
        .with_context(|| {
            format!(
                "failed to open provisioning server on port {}",
                runtime.server.port
            )
        })?;
    if let Some(addr) = driver.local_addr() {
        info!(
            "provisioning server listening on http://{addr} (ap `{}`, gateway {})",
            runtime.access_point.ssid,
            runtime.server.gateway_addr()
        );
    }

    let dns = match CaptiveDns::start(runtime.server.dns_port, runtime.server.gateway_addr()).await
    {
        Ok(dns) => Some(dns),
        Err(err) => {
            warn!(
                "captive dns unavailable on port {}: {err}",
                runtime.server.dns_port
            );
            None
        }
    };

    let mut result = ProvisioningResult::new();
    let server = tokio::select! {
        server = driver.run_until_collected(&mut result) => server,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("interrupted before credentials were collected");
            return Ok(());
        }
    };

    let mut controller = ModeController::new();
    let mut radio = HostRadio {
        connect_timeout_ms: runtime.network.connect_timeout_ms,
        dns,
    };
    let mut server = Some(server);
    let cutover = controller
        .poll(&result, &mut server, &mut radio)
        .context("cutover to station mode failed")?;

    if let Some(cutover) = cutover {
        info!(
            closed = cutover.closed.len(),
            submissions = result.submissions(),
            "provisioning server torn down"
        );
        runtime.network.wifi_ssid = cutover.credentials.ssid().to_string();
        runtime.network.wifi_pass = cutover.credentials.password().to_string();
        store
            .save_runtime_config(&runtime)
            .await
            .context("failed to persist collected credentials")?;
        if let Err(err) = cutover.station {
            warn!("station connect failed: {err}");
        }
    }

    info!(mode = controller.mode().as_str(), "press ctrl-c to exit");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    Ok(())
}
