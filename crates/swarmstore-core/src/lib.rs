pub mod auth;
pub mod bt;
pub mod config;
pub mod error;
pub mod http;
pub mod ids;
pub mod message;
pub mod monitor;
pub mod onion;
pub mod rate_limit;
pub mod rpc;
pub mod store;
pub mod swarm;

pub use auth::{AuthCredentials, Authenticator, SIGNATURE_MAX_AGE_SECS, SIGNATURE_MAX_FUTURE_SECS};
pub use config::NodeConfig;
pub use error::{Error, Result};
pub use ids::{AccountId, MessageHash, NetworkParams, ACCOUNT_ID_SIZE, SESSION_PREFIX};
pub use message::{compute_hash, Message, RetentionTable, DEFAULT_RETENTION, MAX_MESSAGE_SIZE};
pub use monitor::{handle_monitor_request, MonitorRegistry, NotifySink, MONITOR_EXPIRY};
pub use rate_limit::{RateLimiter, ACCOUNT_PER_MINUTE, PUBLIC_PER_MINUTE};
pub use rpc::{
    encode_response, Encoding, Params, RedirectForwarder, Request, RequestHandler, SwarmForwarder,
};
pub use store::{
    DuplicateHandling, MessageStore, StoreOutcome, StoreStats, CLEANUP_PERIOD,
    DEFAULT_RETRIEVE_LIMIT, MAX_RETRIEVE_LIMIT, PAGE_LIMIT, PAGE_SIZE,
};
pub use swarm::{
    single_node_snapshot, NodeRecord, PeerProbe, SwarmId, SwarmRouter, SwarmSnapshot,
    INVALID_SWARM_ID,
};

#[cfg(test)]
mod scenarios;
