//! Channel binding layer for hearth
//!
//! Bridges external hardware channels (interface/device/channel
//! triples) to resource graph cells. Input bindings sample the driver
//! on a periodic framework timer and write transformed values into the
//! graph at driver priority; output bindings push value changes back
//! through the inverse transform. Unmapping removes timers and
//! listeners synchronously; no driver call happens after it returns.

mod binding;
mod driver;

pub use binding::{
    BindingHealth, BindingId, ChannelBindings, ChannelError, Direction, ErrorSink, Transform,
};
pub use driver::{ChannelDriver, ChannelLocator, DriverError, Sample};
