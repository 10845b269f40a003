//! Domain records: devices and registration requests

pub mod device;
pub mod registration;

pub use device::{
    Credentials, Device, DeviceMetrics, DeviceStatus, DeviceStatusUpdate, SYSTEM_OWNER,
};
pub use registration::{DevicePayload, RegistrationRequest, RegistrationStatus};
