pub(crate) mod pipes;
pub(crate) mod poll;
pub(crate) mod process;
