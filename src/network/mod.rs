pub mod cert;
pub mod client;
pub mod connection;
pub mod ips;
pub mod message;
pub mod nat;
pub mod peer; // Peer supervisor
pub mod peer_discovery; // Seed bootstrap
pub mod peer_exchange;
pub mod peer_state; // Live registry
pub mod reconnect;
pub mod rpc;
pub mod server;
pub mod tls;
pub mod wire;
