pub mod broker;
pub mod bus;
pub mod client;
pub mod event;
pub mod keys;
pub mod pubsub;
pub mod registry;
pub mod session;
pub mod sse;

pub use broker::{Broker, BrokerMetrics, LocalClientProvider};
pub use bus::{EventBus, LocalDelivery};
pub use client::{ClientHandle, EnqueueOutcome};
pub use event::{Event, MembershipAction, MembershipUpdate};
pub use keys::Keys;
pub use pubsub::{MemoryPubSubBackend, PubSubBackend, RedisPubSubBackend, Subscription};
pub use registry::{
    ClientConnection, ConnectionRegistry, ConnectionState, MemoryConnectionRegistry,
    RedisConnectionRegistry,
};
pub use session::{MemorySessionStore, RedisSessionStore, SessionStore};
pub use sse::{format_event, EventSink};
