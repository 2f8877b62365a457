pub mod aggregator;
pub mod model;

pub use aggregator::{FoldResult, FoldSummary, StreamAggregator};
pub use model::{
    FollowerSample, GameHistory, GameKey, StreamEvent, StreamKind, StreamerProfile, StreamerRecord,
    ViewSample,
};
