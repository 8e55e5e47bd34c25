pub mod artifact;
pub mod checkpoints;
pub mod db;
pub mod io;

pub use artifact::{
    AdaptPayload, AggregatedTopic, AnalyzePayload, Artifact, ClusterPayload, CollectPayload,
    SourcedTopic, StagePayload, StrategizePayload, TopicCluster,
};
pub use checkpoints::{CheckpointStore, CheckpointVersion, StageCheckpoints};
pub use db::PipelineDb;
