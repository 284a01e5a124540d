//! Platform abstraction facilities

#[cfg(unix)]
pub(crate) mod unix;
#[cfg(unix)]
pub(crate) use unix as platform;

pub(crate) use platform::pipes;
pub(crate) use platform::poll;
pub(crate) use platform::process;
