//! Courier runtime: behavior pipelines, message operations, subscriptions,
//! endpoint lifecycle, and the file-system learning transport.

mod dispatch;
pub mod endpoint;
pub mod error;
pub mod handlers;
pub mod learning;
pub mod operations;
pub mod options;
pub mod pipeline;
pub mod receive;
pub mod routing;
pub mod session;
pub mod subscriptions;

pub use endpoint::{Endpoint, EndpointConfig, EndpointState, FeatureStartupTask, RunningEndpoint};
pub use error::{PipelineError, RoutingError, SubscriptionError};
pub use handlers::{HandlerRegistry, MessageHandler};
pub use operations::MessageOperations;
pub use options::{PublishOptions, ReplyOptions, SendOptions, SubscriptionOptions};
pub use session::{HandlerContext, MessageOps, MessageSession};
pub use subscriptions::{SubscriptionRetrySettings, SubscriptionStorage};
