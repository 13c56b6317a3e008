//! Per-handler event dispatch.

mod pipeline;
mod xattr;

pub use pipeline::{run_checkpoint_ticker, DispatchPipeline, PipelineChannels, PipelineDeps};
pub use xattr::{
    encode_with_xattrs, evaluate_mutation, find_xattr, split_xattrs, GuardVerdict, XattrError,
    XattrMetadata,
};
