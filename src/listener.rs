//! Subscriber side of the hub handshake and content delivery.
//!
//! A [`Listener`] owns no server: the host application routes inbound
//! requests to it (GET verifications to [`Listener::handle_verification`],
//! POST deliveries to [`Listener::handle_delivery`]) and writes the returned
//! status and body back out. Outbound subscribe/unsubscribe handshakes issue
//! one POST to the hub and resolve on the hub's *initial* response — the
//! verification arrives later as a separate inbound request.
//!
//! All observable outcomes are [`ListenerEvent`]s on the channel returned by
//! [`Listener::new`]; a host that drops the receiver loses them.

use crate::codec::{Action, CodecError, Memo, PathCodec, TokenCodec};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Buffered events between a listener and its host.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Errors from the outbound subscribe/unsubscribe handshake.
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// The subscription memo or verification token could not be encoded.
    #[error("Failed to encode subscription: {0}")]
    Codec(#[from] CodecError),
    /// The request to the hub failed at the transport level.
    #[error("Hub request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The hub answered with something other than 202/204.
    #[error("Hub refused with status {0}")]
    HubStatus(u16),
}

/// Everything a listener can tell its host.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    /// A subscribe verification succeeded. Re-raised on lease renewal, so a
    /// host may simply update its stored record again.
    Subscribed { user_data: Value },
    /// An unsubscribe verification succeeded.
    Unsubscribed { user_data: Value },
    /// The hub delivered content for a verified subscription.
    Updated {
        user_data: Value,
        body: String,
        headers: HeaderMap,
    },
    /// An inbound request was rejected; already answered with a 404.
    ProtocolError {
        mode: Option<String>,
        topic: Option<String>,
        reason: String,
    },
}

/// What the host should write back for an inbound hub request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackResponse {
    pub status: u16,
    pub body: String,
}

impl CallbackResponse {
    fn ok(body: impl Into<String>) -> Self {
        CallbackResponse {
            status: 200,
            body: body.into(),
        }
    }

    fn not_found(reason: impl Into<String>) -> Self {
        CallbackResponse {
            status: 404,
            body: reason.into(),
        }
    }
}

/// Options for an outbound subscribe request.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Value to carry in events for this subscription. Defaults to the topic.
    pub data: Option<Value>,
    /// Lease length to request from the hub, in seconds.
    pub lease_seconds: Option<i64>,
    /// Don't treat the subscription as renewable: with a lease, this turns
    /// the lease end into a hard verification deadline.
    pub no_auto: bool,
    /// Key for the hub to sign content deliveries with (`hub.secret`).
    pub signing_key: Option<String>,
}

/// The subscription protocol component.
///
/// Generic over the path and token codecs so deployments can swap the
/// default crypto providers for shared storage.
pub struct Listener<P, K> {
    host: String,
    prefix: String,
    paths: P,
    tokens: K,
    http: reqwest::Client,
    events: mpsc::Sender<ListenerEvent>,
}

impl<P: PathCodec, K: TokenCodec> Listener<P, K> {
    /// Create a listener and the receiving end of its event channel.
    ///
    /// `host` is the externally reachable authority (e.g.
    /// `http://push.example.com`) and `prefix` the path prefix the host
    /// application mounts this listener under (starting with `/`); together
    /// with a minted callback path they form the `hub.callback` URL.
    pub fn new(
        host: impl Into<String>,
        prefix: impl Into<String>,
        paths: P,
        tokens: K,
    ) -> (Self, mpsc::Receiver<ListenerEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Listener {
                host: host.into(),
                prefix: prefix.into(),
                paths,
                tokens,
                http: reqwest::Client::new(),
                events: tx,
            },
            rx,
        )
    }

    /// Whether an inbound request path is meant for this listener.
    pub fn handles(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }

    /// Handle a hub verification request (GET).
    ///
    /// `target` is the request target as received: callback path plus the
    /// `hub.*` query parameters, with or without the mount prefix (hosts
    /// that route by prefix may have stripped it already).
    pub async fn handle_verification(&self, target: &str) -> CallbackResponse {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, q),
            None => (target, ""),
        };
        let path = self.strip_prefix(path);

        let mut mode = None;
        let mut topic = None;
        let mut challenge = None;
        let mut token = None;
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "hub.mode" => mode = Some(value.into_owned()),
                "hub.topic" => topic = Some(value.into_owned()),
                "hub.challenge" => challenge = Some(value.into_owned()),
                "hub.verify_token" => token = Some(value.into_owned()),
                _ => {}
            }
        }

        let (Some(mode), Some(topic), Some(challenge), Some(token)) =
            (mode.clone(), topic.clone(), challenge, token)
        else {
            return self.reject(mode, topic, "Missing parameters").await;
        };

        let Some(memo) = self.paths.lookup(path) else {
            // No record of this subscription: deleted, never stored, or
            // minted by a different secret. For unsubscribe we agree
            // trivially so the hub stops delivering; anything else is
            // refused so the hub never starts.
            return if mode == "unsubscribe" {
                CallbackResponse::ok(challenge)
            } else {
                CallbackResponse::not_found("Unknown subscription")
            };
        };

        match mode.as_str() {
            "subscribe" => {
                // The lease end doubles as a verification deadline for
                // non-renewable subscriptions; renewals past it are refused
                // regardless of the token.
                if let Some(expiry) = memo.expiry {
                    if expiry < Utc::now().timestamp_millis() {
                        return self
                            .reject(Some(mode.clone()), Some(topic), "Expired subscription")
                            .await;
                    }
                }
                if self.tokens.lookup(&token, Action::Subscribe, &topic) {
                    self.emit(ListenerEvent::Subscribed {
                        user_data: memo.user_data,
                    })
                    .await;
                    CallbackResponse::ok(challenge)
                } else {
                    self.reject(
                        Some(mode.clone()),
                        Some(topic),
                        "Invalid hub.verify_token",
                    )
                    .await
                }
            }
            "unsubscribe" => {
                if self.tokens.lookup(&token, Action::Unsubscribe, &topic) {
                    self.emit(ListenerEvent::Unsubscribed {
                        user_data: memo.user_data,
                    })
                    .await;
                    CallbackResponse::ok(challenge)
                } else {
                    self.reject(
                        Some(mode.clone()),
                        Some(topic),
                        "Invalid hub.verify_token",
                    )
                    .await
                }
            }
            _ => {
                self.reject(Some(mode.clone()), Some(topic), "Invalid hub.mode")
                    .await
            }
        }
    }

    /// Handle a content delivery (POST).
    ///
    /// The body arrives as a stream of chunks, however the host's server
    /// framework slices it; it is buffered whole before the `Updated` event
    /// fires. No size limit is enforced at this layer — a host that needs
    /// one must cap the stream itself.
    pub async fn handle_delivery<S, E>(
        &self,
        target: &str,
        headers: HeaderMap,
        mut body: S,
    ) -> CallbackResponse
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let path = match target.split_once('?') {
            Some((p, _)) => p,
            None => target,
        };
        let path = self.strip_prefix(path);

        let Some(memo) = self.paths.lookup(path) else {
            return CallbackResponse::not_found("Unknown subscription");
        };

        let mut buffered = Vec::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => buffered.extend_from_slice(&chunk),
                Err(e) => {
                    tracing::warn!(error = %e, "Delivery body aborted mid-stream");
                    return CallbackResponse {
                        status: 400,
                        body: String::new(),
                    };
                }
            }
        }

        self.emit(ListenerEvent::Updated {
            user_data: memo.user_data,
            body: String::from_utf8_lossy(&buffered).into_owned(),
            headers,
        })
        .await;
        CallbackResponse::ok("")
    }

    /// Ask a hub to start sending updates for `topic`.
    ///
    /// Resolves when the hub acknowledges the request (202/204), returning
    /// the callback path — keep it to unsubscribe later. The hub's actual
    /// verification arrives afterwards as an inbound GET and raises
    /// [`ListenerEvent::Subscribed`] independently.
    pub async fn subscribe(
        &self,
        hub_url: &str,
        topic: &str,
        opts: SubscribeOptions,
    ) -> Result<String, SubscribeError> {
        let memo = Memo {
            user_data: opts
                .data
                .unwrap_or_else(|| Value::String(topic.to_owned())),
            expiry: match opts.lease_seconds {
                Some(lease) if lease != 0 && opts.no_auto => {
                    Some(Utc::now().timestamp_millis() + lease * 1000)
                }
                _ => None,
            },
        };
        let path = self.paths.create(&memo)?;

        let mut form = vec![
            ("hub.mode", Action::Subscribe.as_str().to_owned()),
            ("hub.topic", topic.to_owned()),
            ("hub.verify", "async".to_owned()),
            (
                "hub.verify_token",
                self.tokens.create(Action::Subscribe, topic)?,
            ),
            ("hub.callback", self.callback_url(&path)),
        ];
        if let Some(lease) = opts.lease_seconds.filter(|l| *l != 0) {
            form.push(("lease_seconds", lease.to_string()));
        }
        if let Some(key) = opts.signing_key {
            form.push(("secret", key));
        }

        self.hub_request(hub_url, &form).await?;
        Ok(path)
    }

    /// Ask a hub to stop sending updates for `topic`, identified by the
    /// callback path returned from [`Listener::subscribe`].
    pub async fn unsubscribe(
        &self,
        hub_url: &str,
        topic: &str,
        path: &str,
    ) -> Result<(), SubscribeError> {
        let form = vec![
            ("hub.mode", Action::Unsubscribe.as_str().to_owned()),
            ("hub.topic", topic.to_owned()),
            ("hub.verify", "async".to_owned()),
            (
                "hub.verify_token",
                self.tokens.create(Action::Unsubscribe, topic)?,
            ),
            ("hub.callback", self.callback_url(path)),
        ];
        self.hub_request(hub_url, &form).await
    }

    async fn hub_request(
        &self,
        hub_url: &str,
        form: &[(&str, String)],
    ) -> Result<(), SubscribeError> {
        let response = self.http.post(hub_url).form(form).send().await?;
        match response.status().as_u16() {
            // Hub acknowledged; verification follows asynchronously.
            202 | 204 => Ok(()),
            status => Err(SubscribeError::HubStatus(status)),
        }
    }

    fn callback_url(&self, path: &str) -> String {
        format!("{}{}{}", self.host, self.prefix, path)
    }

    fn strip_prefix<'a>(&self, path: &'a str) -> &'a str {
        path.strip_prefix(&self.prefix).unwrap_or(path)
    }

    async fn reject(
        &self,
        mode: Option<String>,
        topic: Option<String>,
        reason: &str,
    ) -> CallbackResponse {
        self.emit(ListenerEvent::ProtocolError {
            mode,
            topic,
            reason: reason.to_owned(),
        })
        .await;
        CallbackResponse::not_found(reason)
    }

    async fn emit(&self, event: ListenerEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Listener event receiver dropped");
        }
    }
}
