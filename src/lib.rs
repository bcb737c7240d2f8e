pub mod cli;
pub mod data;
pub mod metrics;
pub mod model;
pub mod preprocess;
pub mod sampler;
pub mod sequence;
pub mod storage;
pub mod train;
pub mod windower;
