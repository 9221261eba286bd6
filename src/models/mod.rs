// Domain models: devices, raw wire values, counter keys and emitted samples

mod device;
mod sample;
mod value;

pub use device::{Credentials, Device, InterfaceTarget};
pub use sample::{CounterKey, Direction, OperStatus, Sample};
pub use value::RawValue;
