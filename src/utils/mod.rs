pub mod constants;
pub(crate) mod time;
