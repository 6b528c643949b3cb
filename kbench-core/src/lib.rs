mod broker;
mod events;
mod store;

pub mod engine;

pub use broker::{
    BrokerClient, BrokerConsumer, BrokerError, BrokerProducer, ConsumedRecord, ErrorCategory,
    PartitionMetadata, ProducerRecord, Result as BrokerResult, TopicMetadata,
};
pub use events::{
    ConsumePoint, EventBroadcaster, EventSink, JobEvent, JobSnapshot, MemorySink, ProducePoint,
    Progress,
};
pub use store::{
    JobFilter, JobRecord, JobStatus, JobStore, JobSummary, JobType, MemoryJobStore,
    Result as StoreResult, StoreError, generate_job_id, generate_job_name, summarize,
};
