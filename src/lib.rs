pub mod bridge;
pub mod catalog;
pub mod database_ops;
pub mod errors;
pub mod logging;
pub mod lookup;
pub mod pipeline;
pub mod sources;
pub mod storage;
pub mod streamers;

pub mod util {
    pub mod cancel;
    pub mod env;
}

#[cfg(test)]
pub(crate) mod test_support;
