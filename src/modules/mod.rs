//! WhaleGuard pipeline modules

pub mod dedup;
pub mod dispatcher;
pub mod enricher;
pub mod matcher;
pub mod pipeline;
pub mod poller;
pub mod registry;
pub mod roster;

pub use dedup::{DedupFilter, ProcessedKey};
pub use dispatcher::{AlertDispatcher, DispatchOutcome};
pub use enricher::{AlertRecord, Enricher, TokenMetadata};
pub use matcher::{classify, Classification, Direction};
pub use pipeline::{AlertPipeline, PipelineOutcome};
pub use poller::{decode_transfer, FetchCursor, LogPoller, TransferEvent, TRANSFER_TOPIC};
pub use registry::{WhaleEntry, WhaleRegistry, WhaleSnapshot};
pub use roster::{RosterRefresher, RosterSettings};
