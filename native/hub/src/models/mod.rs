mod settings;
pub(crate) use settings::*;
mod sms;
pub(crate) use sms::*;
pub(crate) mod signals;
