pub(crate) mod settings;
pub(crate) mod sms;
pub(crate) mod storage;
pub(crate) mod system;
