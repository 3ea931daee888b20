pub mod dispatcher;
pub mod failure;
pub mod normalize;
pub mod registry;
pub mod remote;
pub mod request;
pub mod runner;

pub use dispatcher::{Dispatcher, SharedRemoteImageService};
pub use failure::{FailureStage, OperationFailure};
pub use normalize::{ImagePayload, OperationResult};
pub use registry::{OperationRegistry, RoutePolicy};
pub use request::{InputRef, OperationName, OperationRequest, ParamValue};
pub use runner::{CommandSpec, ExecutionOutcome, OperationCommandRunner, StdOperationCommandRunner};
