//! Service modules for the migration pipeline
//!
//! Pure transformation and checking logic plus the promotion batch writer.
//! Phase sequencing lives in `orchestrator`.

pub mod mapping_generator;
pub mod promoter;
pub mod transform;
pub mod validator;

pub use mapping_generator::{draft_mappings, MappingDraft};
pub use promoter::{promote_batch, BatchOutcome};
pub use transform::{check_spec, transform_record, TransformOutput};
pub use validator::{EntityTally, Reservoir};
