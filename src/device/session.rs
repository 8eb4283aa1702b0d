use std::collections::BTreeSet;
use std::future::Future;
use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
use async_trait::async_trait;
use btleplug::api::{self, Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Peripheral as _, ScanFilter, Service, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::future::ready;
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::time::{sleep, timeout, Duration, Instant};

use crate::config::types::TransportConfig;
use crate::device::codec::{build_clear_command, build_rgb_command, decode_status, transfer_messages};
use crate::device::constants::{make_standard_service_uuids, is_short_uuid, ADVERTISED_NAME_PREFIX, CHALLENGE_LEN, SECURITY_KEY};
use crate::device::types::{CommandOutcome, RgbCommandParams, SessionState, StatusSnapshot};
use crate::error::DeviceError;
use crate::frame::Frame;

/// Characteristic level access to a connected peripheral.
#[async_trait]
pub(crate) trait GattLink: Send + Sync {
    async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>, DeviceError>;

    async fn write(&self, characteristic: &Characteristic, payload: &[u8], write_type: WriteType) -> Result<(), DeviceError>;

    async fn disconnect(&self) -> Result<(), DeviceError>;
}

#[async_trait]
impl GattLink for Peripheral {
    async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>, DeviceError> {
        Ok(api::Peripheral::read(self, characteristic).await?)
    }

    async fn write(&self, characteristic: &Characteristic, payload: &[u8], write_type: WriteType) -> Result<(), DeviceError> {
        api::Peripheral::write(self, characteristic, payload, write_type).await
            .map_err(|source| DeviceError::WriteFailed { source })
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        Ok(api::Peripheral::disconnect(self).await?)
    }
}

/// Name the peripheral advertises: the prefix followed by the upper case address digits.
pub fn advertised_name(address: &str) -> String {
    let digits: String = address
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect();

    format!("{}{}", ADVERTISED_NAME_PREFIX, digits.to_uppercase())
}

/// `target` must already be trimmed and lower case.
pub fn is_target(target: &str, address: &str, id: &str, local_name: Option<&str>) -> bool {
    if target.is_empty() {
        return false;
    }

    if address.to_lowercase() == target || id.to_lowercase() == target {
        return true;
    }

    match local_name {
        Some(name) => {
            let name = name.to_lowercase();
            name == target || name == advertised_name(target).to_lowercase()
        },
        None => false,
    }
}

/// The first service that is neither a standard GAP/GATT service nor identified by a short
/// SIG assigned uuid.
pub fn select_vendor_service<'a, I>(services: I) -> Result<&'a Service, DeviceError>
where
    I: IntoIterator<Item = &'a Service>,
{
    let standard = make_standard_service_uuids();

    services
        .into_iter()
        .find(|service| !standard.contains(&service.uuid) && !is_short_uuid(&service.uuid))
        .ok_or(DeviceError::NoVendorService)
}

pub fn is_writable(characteristic: &Characteristic) -> bool {
    characteristic.properties.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
}

pub fn is_readable(characteristic: &Characteristic) -> bool {
    characteristic.properties.contains(CharPropFlags::READ)
}

pub fn is_status(characteristic: &Characteristic) -> bool {
    is_readable(characteristic)
        && !is_writable(characteristic)
        && characteristic.properties.contains(CharPropFlags::NOTIFY)
}

/// Splits the vendor service characteristics into the writable set and the optional status
/// characteristic.
pub fn characteristic_roles(characteristics: &BTreeSet<Characteristic>) -> (Vec<Characteristic>, Option<Characteristic>) {
    let writable = characteristics.iter().filter(|c| is_writable(c)).cloned().collect();
    let status = characteristics.iter().find(|c| is_status(c)).cloned();
    (writable, status)
}

/// The first writable characteristic other than the security one, or the security
/// characteristic itself when it is the only writable one.
pub fn select_command_characteristic(writable: &[Characteristic], security: &Characteristic) -> Characteristic {
    writable
        .iter()
        .find(|c| c.uuid != security.uuid)
        .unwrap_or(security)
        .clone()
}

fn encrypt_block(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);

    let mut out = [0u8; 16];
    out.copy_from_slice(&buf);
    out
}

/// AES-128-ECB (single block, no padding) under the pre-shared key.
pub fn encrypt_challenge(challenge: &[u8; CHALLENGE_LEN]) -> [u8; CHALLENGE_LEN] {
    encrypt_block(&SECURITY_KEY, challenge)
}

fn preferred_write_type(characteristic: &Characteristic) -> WriteType {
    if characteristic.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
        WriteType::WithoutResponse
    } else {
        WriteType::WithResponse
    }
}

fn log_state(target: &str, state: SessionState) {
    debug!("Session {}: {:?}", target, state);
}

pub async fn first_adapter(adapters: Vec<Adapter>) -> Result<Adapter, DeviceError> {
    let adapter = adapters.into_iter().next().ok_or(DeviceError::NoAdapter)?;
    info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
    Ok(adapter)
}

async fn wait_for_powered_on(adapter: &Adapter, deadline: Duration) -> Result<(), DeviceError> {
    // subscribe before asking for the state so that an update in between is not lost
    let mut events = adapter.events().await?;

    if matches!(adapter.adapter_state().await?, CentralState::PoweredOn) {
        return Ok(());
    }

    info!("Waiting for bluetooth adapter to power on...");
    let powered_on = timeout(deadline, async {
        while let Some(event) = events.next().await {
            if let CentralEvent::StateUpdate(CentralState::PoweredOn) = event {
                return true;
            }
        }
        false
    }).await;

    match powered_on {
        Ok(true) => Ok(()),
        _ => Err(DeviceError::AdapterUnavailable { timeout: deadline }),
    }
}

async fn peripheral_matches(peripheral: &Peripheral, target: &str) -> bool {
    let id = peripheral.id().to_string();

    match peripheral.properties().await {
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            false
        },
        Ok(None) => is_target(target, &peripheral.address().to_string(), &id, None),
        Ok(Some(properties)) => is_target(
            target,
            &properties.address.to_string(),
            &id,
            properties.local_name.as_deref(),
        ),
    }
}

/// Feeds stream items to `matches` until one yields a value. Running out of items means the
/// adapter stopped reporting events.
async fn first_match<S, T, R, F, Fut>(stream: S, mut matches: F) -> Result<R, DeviceError>
where
    S: Stream<Item = T>,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Option<R>>,
{
    let mut stream = Box::pin(stream);

    while let Some(item) = stream.next().await {
        if let Some(found) = matches(item).await {
            return Ok(found);
        }
    }

    Err(DeviceError::EventStreamClosed)
}

async fn scan_for(adapter: &Adapter, target: &str) -> Result<Peripheral, DeviceError> {
    let events = adapter.events().await?;

    // the adapter may already know the peripheral from an earlier scan
    for peripheral in adapter.peripherals().await? {
        if peripheral_matches(&peripheral, target).await {
            return Ok(peripheral);
        }
    }

    let discovered = events.filter_map(|event| ready(match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => Some(id),
        _ => None,
    }));

    first_match(discovered, move |id| async move {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(peripheral) => peripheral,
            Err(err) => {
                warn!("Failed to look up discovered peripheral: {}", err);
                return None;
            },
        };

        if peripheral_matches(&peripheral, target).await {
            Some(peripheral)
        } else {
            None
        }
    }).await
}

/// Scans until a peripheral matching `target` shows up or `scan_timeout` elapses. Scanning is
/// stopped in both cases, and the event stream is dropped with the scan future.
pub async fn discover(adapter: &Adapter, target: &str, scan_timeout: Duration) -> Result<Peripheral, DeviceError> {
    let target = target.trim().to_lowercase();

    wait_for_powered_on(adapter, scan_timeout).await?;

    info!("Scanning for {}...", target);
    adapter.start_scan(ScanFilter::default()).await?;

    let found = timeout(scan_timeout, scan_for(adapter, &target)).await;

    if let Err(err) = adapter.stop_scan().await {
        warn!("Failed to stop scanning: {:?}", err);
    }

    match found {
        Ok(result) => result,
        Err(_) => Err(DeviceError::DiscoveryTimeout { target, timeout: scan_timeout }),
    }
}

async fn unlock<L: GattLink>(link: &L, writable: &[Characteristic], settle: Duration) -> Result<Characteristic, DeviceError> {
    if writable.is_empty() {
        return Err(DeviceError::NoWritableCharacteristic);
    }

    let mut found: Option<(Characteristic, [u8; CHALLENGE_LEN])> = None;

    for characteristic in writable.iter().filter(|c| is_readable(c)) {
        match link.read(characteristic).await {
            Ok(data) => {
                if let Ok(challenge) = <[u8; CHALLENGE_LEN]>::try_from(data.as_slice()) {
                    found = Some((characteristic.clone(), challenge));
                    break;
                }
                debug!("Characteristic {} returned {} bytes, not a challenge", characteristic.uuid, data.len());
            },
            Err(err) => debug!("Probing characteristic {} failed: {}", characteristic.uuid, err),
        }
    }

    let (security_char, challenge) = found.ok_or(DeviceError::MissingSecurityCharacteristic)?;

    info!("Answering unlock challenge on {}", security_char.uuid);
    let response = encrypt_challenge(&challenge);
    link.write(&security_char, &response, WriteType::WithResponse).await?;

    sleep(settle).await;

    Ok(security_char)
}

/// An unlocked connection to one peripheral. Owned by exactly one command execution and closed
/// when it finishes.
pub(crate) struct Session<L: GattLink = Peripheral> {
    link: L,
    command_char: Characteristic,
    status_char: Option<Characteristic>,
    config: TransportConfig,
    target: String,
}

impl Session<Peripheral> {
    pub async fn open(adapter: &Adapter, target: &str, config: &TransportConfig) -> Result<Self, DeviceError> {
        log_state(target, SessionState::Discovering);
        let peripheral = discover(adapter, target, config.scan_timeout()).await?;

        log_state(target, SessionState::Connecting);
        peripheral.connect().await
            .map_err(|source| DeviceError::ConnectFailed { source })?;

        match Session::setup(peripheral.clone(), target, config).await {
            Ok(session) => Ok(session),
            Err(err) => {
                log_state(target, SessionState::Disconnecting);
                if let Err(disconnect_err) = GattLink::disconnect(&peripheral).await {
                    warn!("Failed to disconnect after setup failure: {}", disconnect_err);
                }
                log_state(target, SessionState::Closed);
                Err(err)
            },
        }
    }

    async fn setup(peripheral: Peripheral, target: &str, config: &TransportConfig) -> Result<Self, DeviceError> {
        log_state(target, SessionState::DiscoveringServices);
        peripheral.discover_services().await?;

        let services = peripheral.services();
        let vendor_service = select_vendor_service(&services)?;
        let (writable, status_char) = characteristic_roles(&vendor_service.characteristics);

        log_state(target, SessionState::Unlocking);
        let security_char = unlock(&peripheral, &writable, config.unlock_settle()).await?;
        let command_char = select_command_characteristic(&writable, &security_char);

        info!(
            "Session ready for {} (service {}, command {}, status {})",
            target,
            vendor_service.uuid,
            command_char.uuid,
            status_char.as_ref().map(|c| c.uuid.to_string()).unwrap_or(String::from("NONE")),
        );
        log_state(target, SessionState::Ready);

        Ok(Session::new(peripheral, command_char, status_char, config, target))
    }
}

impl<L: GattLink> Session<L> {
    pub(crate) fn new(link: L, command_char: Characteristic, status_char: Option<Characteristic>, config: &TransportConfig, target: &str) -> Self {
        Session {
            link,
            command_char,
            status_char,
            config: config.clone(),
            target: target.to_string(),
        }
    }

    async fn write(&self, payload: &[u8], write_type: WriteType) -> Result<(), DeviceError> {
        self.link.write(&self.command_char, payload, write_type).await
    }

    /// Sends application data, without response when the characteristic allows it.
    pub async fn send(&self, payload: &[u8]) -> Result<(), DeviceError> {
        self.write(payload, preferred_write_type(&self.command_char)).await
    }

    pub async fn read_status(&self) -> Result<StatusSnapshot, DeviceError> {
        match &self.status_char {
            None => Ok(StatusSnapshot::default()),
            Some(status_char) => {
                let bytes = self.link.read(status_char).await?;
                Ok(decode_status(&bytes))
            },
        }
    }

    /// Best effort: reads the status until the device reports idle or the poll window closes.
    /// Failures are logged and end the poll; they never fail the command.
    pub async fn poll_status(&self) -> StatusSnapshot {
        let mut last = StatusSnapshot::default();
        if self.status_char.is_none() || !self.config.poll_status {
            return last;
        }

        let deadline = Instant::now() + self.config.status_poll_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.read_status()).await {
                Ok(Ok(status)) => last = status,
                Ok(Err(err)) => {
                    warn!("Failed to read status of {}: {}", self.target, err);
                    break;
                },
                Err(_) => break,
            }

            if !last.busy || Instant::now() + self.config.status_poll_interval() >= deadline {
                break;
            }
            sleep(self.config.status_poll_interval()).await;
        }

        if last.has_errors() {
            let errors: Vec<String> = last.errors.iter().map(|e| e.to_string()).collect();
            warn!("Device {} reports: {}", self.target, errors.join(", "));
        }
        last
    }

    pub async fn clear(&self) -> Result<CommandOutcome, DeviceError> {
        info!("Clearing screen of {}", self.target);
        self.write(&build_clear_command(), WriteType::WithResponse).await?;
        Ok(CommandOutcome { status: self.poll_status().await })
    }

    pub async fn flash(&self, params: &RgbCommandParams) -> Result<CommandOutcome, DeviceError> {
        info!("Flashing {} with {:?}", self.target, params);
        self.send(&build_rgb_command(params)).await?;
        Ok(CommandOutcome { status: self.poll_status().await })
    }

    /// Streams the frame as acknowledged chunk writes, then commits it.
    pub async fn write_frame(&self, frame: &Frame) -> Result<CommandOutcome, DeviceError> {
        let messages = transfer_messages(frame.as_bytes(), self.config.chunk_bytes)?;
        let chunk_count = messages.len() - 1;
        info!("Writing {} byte frame to {} in {} chunks", frame.len(), self.target, chunk_count);

        for (index, message) in messages.iter().enumerate() {
            self.write(message, WriteType::WithResponse).await?;

            if index < chunk_count && self.config.inter_chunk_delay_ms > 0 {
                sleep(self.config.inter_chunk_delay()).await;
            }
        }

        Ok(CommandOutcome { status: self.poll_status().await })
    }

    /// Disconnects. Failures are logged only: the command outcome is already decided.
    pub async fn close(self) {
        log_state(&self.target, SessionState::Disconnecting);
        if let Err(err) = self.link.disconnect().await {
            warn!("Failed to disconnect from {}: {}", self.target, err);
        }
        log_state(&self.target, SessionState::Closed);
    }
}
