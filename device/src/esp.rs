use core::convert::TryInto;
use std::{
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, prelude::Peripherals},
    io::vfs::MountedEventfs,
    ipv4::{Configuration as IpConfiguration, Mask, RouterConfiguration, Subnet},
    log::EspLogger,
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::{esp, esp_netif_dhcps_stop, ESP_ERR_ESP_NETIF_DHCP_ALREADY_STOPPED},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use provision_common::{
    config::{AccessPointConfig, ServerConfig},
    Credentials, ModeController, ModeError, ProvisioningResult, RadioServices, RuntimeConfig,
    StatusLed,
};

use crate::net::{CaptiveDns, ProvisioningDriver};

const NVS_NAMESPACE: &str = "provision";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const EVENTFD_SLOTS: usize = 5;
const WIFI_RETRY_DELAY_MS: u64 = 1_000;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

// Runs without a pin when the GPIO cannot be claimed.
struct BoardLed {
    pin: Option<PinDriver<'static, AnyOutputPin, Output>>,
    lit: bool,
}

impl BoardLed {
    fn new(pin: i32) -> Self {
        let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
        match driver {
            Ok(mut driver) => {
                let _ = driver.set_low();
                Self {
                    pin: Some(driver),
                    lit: false,
                }
            }
            Err(err) => {
                warn!("status LED unavailable on GPIO{pin}: {err}");
                Self {
                    pin: None,
                    lit: false,
                }
            }
        }
    }
}

impl StatusLed for BoardLed {
    fn is_on(&self) -> bool {
        self.lit
    }

    fn set(&mut self, on: bool) {
        let Some(pin) = self.pin.as_mut() else {
            self.lit = on;
            return;
        };
        let outcome = if on { pin.set_high() } else { pin.set_low() };
        match outcome {
            Ok(()) => self.lit = on,
            Err(err) => warn!("failed to drive status LED: {err}"),
        }
    }
}

struct EspRadio<'a> {
    wifi: &'a mut BlockingWifi<EspWifi<'static>>,
    dns: Option<CaptiveDns>,
    connect_timeout_ms: u64,
}

impl RadioServices for EspRadio<'_> {
    fn stop_helpers(&mut self) -> Result<(), ModeError> {
        if let Some(dns) = self.dns.take() {
            dns.stop();
        }
        let handle = self.wifi.wifi().ap_netif().handle();
        match esp!(unsafe { esp_netif_dhcps_stop(handle) }) {
            Ok(()) => Ok(()),
            Err(err) if err.code() == ESP_ERR_ESP_NETIF_DHCP_ALREADY_STOPPED as i32 => Ok(()),
            Err(err) => Err(ModeError::Helpers(err.to_string())),
        }
    }

    fn disable_access_point(&mut self) -> Result<(), ModeError> {
        self.wifi
            .stop()
            .map_err(|err| ModeError::AccessPoint(err.to_string()))
    }

    fn connect_station(&mut self, credentials: &Credentials) -> Result<(), ModeError> {
        let auth_method = if credentials.password().is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: credentials
                    .ssid()
                    .try_into()
                    .map_err(|_| ModeError::Station("wifi ssid too long".to_string()))?,
                password: credentials
                    .password()
                    .try_into()
                    .map_err(|_| ModeError::Station("wifi password too long".to_string()))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(|err| ModeError::Station(err.to_string()))?;
        self.wifi
            .start()
            .map_err(|err| ModeError::Station(err.to_string()))?;
        info!("wifi started, connecting to `{}`", credentials.ssid());

        let deadline = Instant::now() + Duration::from_millis(self.connect_timeout_ms);
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let err = match self.wifi.connect() {
                Ok(()) => match self.wifi.wait_netif_up() {
                    Ok(()) => {
                        info!("wifi connected and netif up on attempt {attempt}");
                        return Ok(());
                    }
                    Err(err) => err,
                },
                Err(err) => err,
            };
            warn!("wifi connect attempt {attempt} failed: {err}");
            if Instant::now() >= deadline {
                let _ = self.wifi.disconnect();
                return Err(ModeError::Station(format!(
                    "gave up after {attempt} attempts: {err}"
                )));
            }
            let _ = self.wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }
}

fn build_ap_netif(server: &ServerConfig) -> anyhow::Result<EspNetif> {
    let gateway = server.gateway_addr();
    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Router(RouterConfiguration {
            subnet: Subnet {
                gateway,
                mask: Mask(server.netmask_prefix()),
            },
            dhcp_enabled: true,
            dns: Some(gateway),
            secondary_dns: None,
        })),
        ..NetifConfiguration::wifi_default_router()
    };

    Ok(EspNetif::new_with_conf(&conf)?)
}

fn start_provisioning_ap(
    wifi: &mut BlockingWifi<EspWifi<'static>>,
    ap: &AccessPointConfig,
) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: ap
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: ap
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: ap.channel,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("provisioning AP started on `{}`", ap.ssid);
    Ok(())
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let Peripherals { modem, .. } = Peripherals::take()?;
    let led = BoardLed::new(runtime.led_pin);

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    esp_wifi
        .swap_netif_ap(build_ap_netif(&runtime.server)?)
        .context("failed to apply provisioning AP netif configuration")?;
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
    start_provisioning_ap(&mut wifi, &runtime.access_point).context("soft-AP startup failed")?;

    let _eventfs = MountedEventfs::mount(EVENTFD_SLOTS).context("failed to mount eventfd")?;
    let executor = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let mut result = ProvisioningResult::new();
    let mut controller = ModeController::new();
    let drain = Duration::from_millis(runtime.server.poll_interval_ms);
    let cutover = executor.block_on(async {
        let dns = match CaptiveDns::start(runtime.server.dns_port, runtime.server.gateway_addr())
            .await
        {
            Ok(dns) => Some(dns),
            Err(err) => {
                warn!("captive dns unavailable: {err}");
                None
            }
        };
        let driver = ProvisioningDriver::open(&runtime.server, led)
            .context("failed to open provisioning server")?;
        let mut server = Some(driver.run_until_collected(&mut result).await);

        // Let the success page reach the client before the AP goes down.
        tokio::time::sleep(drain).await;

        let mut radio = EspRadio {
            wifi: &mut wifi,
            dns,
            connect_timeout_ms: runtime.network.connect_timeout_ms,
        };
        controller
            .poll(&result, &mut server, &mut radio)
            .context("cutover to station mode failed")
    })?;

    if let Some(cutover) = cutover {
        runtime.network.wifi_ssid = cutover.credentials.ssid().to_string();
        runtime.network.wifi_pass = cutover.credentials.password().to_string();
        if let Err(err) = nvs_store.save_runtime_config(&runtime) {
            warn!("failed to persist collected credentials: {err:#}");
        }
        match cutover.station {
            Ok(()) => info!("station mode active on `{}`", cutover.credentials.ssid()),
            Err(err) => warn!("station mode entered without a link: {err}"),
        }
    }

    // Keep the radio alive for the program lifetime.
    let _wifi = wifi;
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
