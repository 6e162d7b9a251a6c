pub mod containment;
mod edits;
mod mount;
mod personalize;
pub mod pipeline;
mod stages;

#[cfg(test)]
mod testing;

pub use containment::{FailFast, RecoveryDecision, RecoveryHandler, StageContext, StageFailure};
pub use pipeline::{
    run_provisioning, OperatorIdentity, Personalization, PipelineError, ProvisionParams,
    ProvisionResult,
};
pub use stages::Stage;

use std::path::Path;

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
