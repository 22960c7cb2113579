mod relay_engine;
pub(crate) mod relay_loop;

pub use relay_engine::RelayEngine;
