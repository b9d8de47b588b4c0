use log::{info, warn};

use crate::{
    connection::Closed,
    credentials::{Credentials, ProvisioningResult},
    error::ModeError,
    listener::{shutdown_server, ProvisioningServer, Stack},
    response::StatusLed,
    types::DeviceMode,
};

pub trait RadioServices {
    fn stop_helpers(&mut self) -> Result<(), ModeError>;
    fn disable_access_point(&mut self) -> Result<(), ModeError>;
    fn connect_station(&mut self, credentials: &Credentials) -> Result<(), ModeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cutover {
    pub credentials: Credentials,
    pub closed: Vec<Closed>,
    // Station mode is entered either way.
    pub station: Result<(), ModeError>,
}

#[derive(Debug)]
pub struct ModeController {
    mode: DeviceMode,
}

impl Default for ModeController {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeController {
    pub fn new() -> Self {
        Self {
            mode: DeviceMode::Provisioning,
        }
    }

    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    // A helper or AP failure leaves the controller in `CuttingOver`.
    pub fn poll<S: Stack, L: StatusLed, R: RadioServices>(
        &mut self,
        result: &ProvisioningResult,
        server: &mut Option<ProvisioningServer<S, L>>,
        radio: &mut R,
    ) -> Result<Option<Cutover>, ModeError> {
        if self.mode != DeviceMode::Provisioning {
            return Ok(None);
        }
        let Some(credentials) = result.credentials().cloned() else {
            return Ok(None);
        };

        self.mode = DeviceMode::CuttingOver;
        info!("credentials collected, leaving provisioning mode");

        radio.stop_helpers()?;
        let closed = shutdown_server(server.take());
        radio.disable_access_point()?;

        let station = radio.connect_station(&credentials);
        match &station {
            Ok(()) => info!("joined network `{}`", credentials.ssid()),
            Err(err) => warn!("station connect to `{}` failed: {err}", credentials.ssid()),
        }
        self.mode = DeviceMode::Station;

        Ok(Some(Cutover {
            credentials,
            closed,
            station,
        }))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::ServerConfig,
        connection::CloseReason,
        testing::{FakeLed, FakeStack, RecordingEndpoint},
    };

    #[derive(Default)]
    struct FakeRadio {
        calls: Vec<String>,
        fail_helpers: bool,
        fail_station: bool,
    }

    impl RadioServices for FakeRadio {
        fn stop_helpers(&mut self) -> Result<(), ModeError> {
            self.calls.push("stop_helpers".to_string());
            if self.fail_helpers {
                return Err(ModeError::Helpers("dhcp still running".to_string()));
            }
            Ok(())
        }

        fn disable_access_point(&mut self) -> Result<(), ModeError> {
            self.calls.push("disable_access_point".to_string());
            Ok(())
        }

        fn connect_station(&mut self, credentials: &Credentials) -> Result<(), ModeError> {
            self.calls.push(format!("connect_station {}", credentials.ssid()));
            if self.fail_station {
                return Err(ModeError::Station("auth failed".to_string()));
            }
            Ok(())
        }
    }

    fn server() -> Option<ProvisioningServer<FakeStack, FakeLed>> {
        let mut stack = FakeStack::default();
        ProvisioningServer::open(&mut stack, &ServerConfig::default(), FakeLed::default()).ok()
    }

    fn collected() -> ProvisioningResult {
        let mut result = ProvisioningResult::new();
        result.record(Credentials::new("Office", "s3cretpw").unwrap());
        result
    }

    #[test]
    fn nothing_happens_before_collection() {
        let mut controller = ModeController::new();
        let mut server = server();
        let mut radio = FakeRadio::default();

        let outcome = controller.poll(&ProvisioningResult::new(), &mut server, &mut radio);

        assert_eq!(outcome, Ok(None));
        assert_eq!(controller.mode(), DeviceMode::Provisioning);
        assert!(server.is_some());
        assert!(radio.calls.is_empty());
    }

    #[test]
    fn cutover_runs_in_order_and_only_once() {
        let mut controller = ModeController::new();
        let mut server = server();
        let (endpoint, log) = RecordingEndpoint::new();
        if let Some(server) = server.as_mut() {
            server.on_accept(Some(endpoint), Ok(()), 0).unwrap();
        }
        let mut radio = FakeRadio::default();
        let result = collected();

        let cutover = controller
            .poll(&result, &mut server, &mut radio)
            .unwrap()
            .unwrap();

        assert_eq!(
            radio.calls,
            vec![
                "stop_helpers".to_string(),
                "disable_access_point".to_string(),
                "connect_station Office".to_string(),
            ]
        );
        assert_eq!(cutover.credentials.ssid(), "Office");
        assert_eq!(cutover.closed.len(), 1);
        assert_eq!(cutover.closed[0].reason, CloseReason::ServerShutdown);
        assert_eq!(cutover.station, Ok(()));
        assert_eq!(log.borrow().closes, 1);
        assert!(server.is_none());
        assert_eq!(controller.mode(), DeviceMode::Station);

        assert_eq!(controller.poll(&result, &mut server, &mut radio), Ok(None));
        assert_eq!(radio.calls.len(), 3);
    }

    #[test]
    fn failed_station_join_still_ends_in_station_mode() {
        let mut controller = ModeController::new();
        let mut server = server();
        let mut radio = FakeRadio {
            fail_station: true,
            ..FakeRadio::default()
        };

        let cutover = controller
            .poll(&collected(), &mut server, &mut radio)
            .unwrap()
            .unwrap();

        assert_eq!(
            cutover.station,
            Err(ModeError::Station("auth failed".to_string()))
        );
        assert_eq!(controller.mode(), DeviceMode::Station);
    }

    #[test]
    fn helper_failure_stops_cutover_midway() {
        let mut controller = ModeController::new();
        let mut server = server();
        let mut radio = FakeRadio {
            fail_helpers: true,
            ..FakeRadio::default()
        };

        let outcome = controller.poll(&collected(), &mut server, &mut radio);

        assert_eq!(
            outcome,
            Err(ModeError::Helpers("dhcp still running".to_string()))
        );
        assert_eq!(controller.mode(), DeviceMode::CuttingOver);
        assert!(server.is_some());
        assert_eq!(controller.poll(&collected(), &mut server, &mut radio), Ok(None));
    }
}
