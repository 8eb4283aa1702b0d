use async_trait::async_trait;
use btleplug::api::Manager as _;
use btleplug::platform::{Adapter, Manager};
use log::info;

use crate::config::types::TransportConfig;
use crate::device::session::{first_adapter, GattLink, Session};
use crate::device::types::{CommandOutcome, DeviceTarget, RgbCommandParams};
use crate::error::DeviceError;
use crate::frame::Frame;

/// The three wire commands, each executed in its own session. Only the device queue calls
/// these, which keeps at most one session per device open.
#[async_trait]
pub trait EslTransport: Send + Sync {
    async fn clear(&self, target: &DeviceTarget) -> Result<CommandOutcome, DeviceError>;

    async fn flash(&self, target: &DeviceTarget, params: RgbCommandParams) -> Result<CommandOutcome, DeviceError>;

    async fn write_frame(&self, target: &DeviceTarget, frame: &Frame) -> Result<CommandOutcome, DeviceError>;
}

pub struct BleTransport {
    manager: Manager,
    config: TransportConfig,
}

impl BleTransport {
    pub async fn new(config: TransportConfig) -> Result<Self, DeviceError> {
        let manager = Manager::new().await.map_err(map_permission_error)?;
        Ok(BleTransport { manager, config })
    }

    async fn adapter(&self) -> Result<Adapter, DeviceError> {
        let adapters = self.manager.adapters().await.map_err(map_permission_error)?;
        first_adapter(adapters).await
    }

    async fn open(&self, target: &DeviceTarget) -> Result<Session, DeviceError> {
        let adapter = self.adapter().await?;
        Session::open(&adapter, &target.address, &self.config).await
    }
}

fn map_permission_error(err: btleplug::Error) -> DeviceError {
    match err {
        btleplug::Error::PermissionDenied => DeviceError::PermissionDenied,
        source => DeviceError::Btle { source },
    }
}

/// The work done inside one session.
pub(crate) enum Operation<'a> {
    Clear,
    Flash(RgbCommandParams),
    WriteFrame(&'a Frame),
}

/// Runs `operation` and closes the session afterwards, whether the operation failed or not.
pub(crate) async fn run_in_session<L: GattLink>(session: Session<L>, operation: Operation<'_>) -> Result<CommandOutcome, DeviceError> {
    let result = match operation {
        Operation::Clear => session.clear().await,
        Operation::Flash(params) => session.flash(&params).await,
        Operation::WriteFrame(frame) => session.write_frame(frame).await,
    };

    session.close().await;
    result
}

#[async_trait]
impl EslTransport for BleTransport {
    async fn clear(&self, target: &DeviceTarget) -> Result<CommandOutcome, DeviceError> {
        run_in_session(self.open(target).await?, Operation::Clear).await
    }

    async fn flash(&self, target: &DeviceTarget, params: RgbCommandParams) -> Result<CommandOutcome, DeviceError> {
        run_in_session(self.open(target).await?, Operation::Flash(params)).await
    }

    async fn write_frame(&self, target: &DeviceTarget, frame: &Frame) -> Result<CommandOutcome, DeviceError> {
        let result = run_in_session(self.open(target).await?, Operation::WriteFrame(frame)).await;

        if result.is_ok() {
            info!("Frame committed to {}", target.address);
        }
        result
    }
}
