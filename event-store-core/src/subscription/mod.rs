//! The persistent subscription engine: the per-subscription finite state
//! machine (C5, [`fsm`]), partitioned fan-out (C6, [`partition`]), the
//! actor task that drives the two (C7's unit of supervision, [`actor`]),
//! the consumer-facing endpoint boundary ([`endpoint`]), and the supervisor
//! and orchestrator (C7/C8, [`supervisor`]) that together make up the
//! public entry points: subscribe, unsubscribe, delete, ack.

pub mod actor;
pub mod endpoint;
pub mod fsm;
pub mod partition;
pub mod state;
pub mod supervisor;

pub use actor::{ActorMessage, SubscriptionActor};
pub use endpoint::{
    Ack, ChannelEndpoint, ChannelMessage, EventSink, MappedSink, SubscriberEndpoint, SubscriptionHandle,
};
pub use fsm::{Effect, State, Trigger};
pub use partition::{Deliveries, EndpointId, PartitionKey, Subscriber, SubscriberSet};
pub use state::{SubscriptionConfig, SubscriptionContext, SubscriptionState};
pub use supervisor::{SubscribeOptions, Supervisor};
