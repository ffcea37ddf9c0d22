pub mod device;

pub use device::DeviceConfig;
