mod dataset;
mod error;
mod partition;
mod provider;

pub use dataset::{Dataset, Subset};
pub use error::{DataError, Result};
pub use partition::{partition, split_label_pool, Partition, Shard};
pub use provider::{CsvDataset, DatasetProvider, SyntheticBlobs};
