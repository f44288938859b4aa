pub mod buffer;
pub mod config;
pub mod configurator;
pub mod device;
pub mod error;
pub mod kernel_tun;
pub mod port;
pub mod suppress;
pub mod task;
pub mod to_device;

#[cfg(test)]
mod test;

pub use buffer::PacketBuffer;
pub use config::{EtherAddress, SenderConfig, TunConfig};
pub use configurator::{AddressConfigurator, Addressing, Ifconfig};
pub use device::{Device, SystemOpener, Variant};
pub use error::{Error, Result};
pub use kernel_tun::KernelTun;
pub use port::{Output, Queue, Upstream};
pub use task::{CooperativeTask, Poll, ReadinessSignal, Scheduler};
pub use to_device::ToDevice;
