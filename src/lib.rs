//! Subscriber side of the PubSubHubbub protocol.
//!
//! Three independent pieces, assembled by the host application:
//!
//! - [`Listener`] speaks the subscription protocol: outbound
//!   subscribe/unsubscribe handshakes and inbound hub verification and
//!   content delivery, mounted under any HTTP server.
//! - [`Scheduler`] polls plain HTTP resources on an interval with
//!   conditional GET, redirect handling, and exponential backoff, for topics
//!   with no hub.
//! - [`Dedup`] filters the overlapping entry batches both sources produce
//!   down to what has not been seen before.
//!
//! [`build`] wires a listener from a [`Config`] with warned defaults;
//! [`poller`] does the same for a scheduler.

pub mod codec;
pub mod config;
pub mod dedup;
pub mod listener;
pub mod scheduler;

pub use codec::{Action, CodecError, CryptoPathCodec, CryptoTokenCodec, Memo, PathCodec, TokenCodec};
pub use config::{Config, ConfigError, PollSettings};
pub use dedup::{Dedup, Entry};
pub use listener::{CallbackResponse, Listener, ListenerEvent, SubscribeError, SubscribeOptions};
pub use scheduler::{
    PollEvent, PollOptions, PollOutcome, PollPolicy, PollRequest, PollResponse, PollState,
    PollStatus, ReqwestTransport, Scheduler, Transport,
};

use rand::distributions::Alphanumeric;
use rand::Rng;
use secrecy::ExposeSecret;
use tokio::sync::mpsc;

/// Build a listener from configuration, substituting warned defaults for
/// anything unset.
///
/// A generated secret works for a single process but not behind a load
/// balancer: every instance must decode callback paths minted by the others,
/// so shared deployments must configure `secret` explicitly.
pub fn build(
    config: &Config,
) -> (
    Listener<CryptoPathCodec, CryptoTokenCodec>,
    mpsc::Receiver<ListenerEvent>,
) {
    let host = match &config.host {
        Some(host) => host.clone(),
        None => {
            tracing::warn!("No host configured, defaulting to localhost:8080");
            "http://localhost:8080".to_owned()
        }
    };
    let prefix = match &config.prefix {
        Some(prefix) => prefix.clone(),
        None => {
            tracing::warn!("No prefix configured, defaulting to /subhub");
            "/subhub".to_owned()
        }
    };
    let secret = match &config.secret {
        Some(secret) => secret.expose_secret().to_owned(),
        None => {
            tracing::warn!(
                "No secret configured, generated one; load-balanced deployments must share a secret explicitly"
            );
            rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(32)
                .map(char::from)
                .collect()
        }
    };

    Listener::new(
        host,
        prefix,
        CryptoPathCodec::new(&secret),
        CryptoTokenCodec::new(&secret),
    )
}

/// Build a scheduler over the default HTTP transport with the configured
/// polling policy.
pub fn poller(
    config: &Config,
) -> Result<(Scheduler<ReqwestTransport>, mpsc::Receiver<PollEvent>), reqwest::Error> {
    let transport = ReqwestTransport::new()?;
    Ok(Scheduler::new(transport, config.poll.policy()))
}
