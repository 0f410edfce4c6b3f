//! Web Session Middleware
//!
//! Cookie sessions backed by the storage collaborator's session store. The
//! cookie carries the session id and an HMAC-SHA256 tag keyed by the session
//! secret; session data never leaves the store.

use crate::domain::entities::{unix_millis, Session};
use crate::domain::ports::SessionStore;
use axum::{
    body::Body,
    extract::Extension,
    http::{header, HeaderValue, Request},
    middleware::{self, Next},
    response::Response,
    Router,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

pub const SESSION_COOKIE: &str = "ireva.sid";

/// Lifetime of a session after its last write.
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const HMAC_BLOCK: usize = 64;

/// HMAC-SHA256 of `message`, hex encoded.
pub fn sign(secret: &[u8], message: &str) -> String {
    let mut key = [0u8; HMAC_BLOCK];
    if secret.len() > HMAC_BLOCK {
        let digest = Sha256::digest(secret);
        key[..digest.len()].copy_from_slice(&digest);
    } else {
        key[..secret.len()].copy_from_slice(secret);
    }

    let mut inner = Sha256::new();
    inner.update(key.map(|b| b ^ 0x36));
    inner.update(message.as_bytes());

    let mut outer = Sha256::new();
    outer.update(key.map(|b| b ^ 0x5c));
    outer.update(inner.finalize());
    hex::encode(outer.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Session store and signing key shared by the middleware.
#[derive(Clone)]
pub struct SessionConfig {
    store: Arc<dyn SessionStore>,
    secret: Arc<str>,
    ttl: Duration,
}

impl SessionConfig {
    pub fn new(store: Arc<dyn SessionStore>, secret: &str) -> Self {
        Self {
            store,
            secret: Arc::from(secret),
            ttl: SESSION_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Cookie value for `sid`.
    pub fn cookie_value(&self, sid: &str) -> String {
        format!("{}.{}", sid, sign(self.secret.as_bytes(), sid))
    }

    /// The session id of a correctly signed cookie value.
    pub fn verify<'a>(&self, value: &'a str) -> Option<&'a str> {
        let (sid, tag) = value.rsplit_once('.')?;
        let expected = sign(self.secret.as_bytes(), sid);
        constant_time_eq(expected.as_bytes(), tag.as_bytes()).then_some(sid)
    }

    /// Wrap `router` so its handlers can use [`SessionHandle`].
    pub fn layer(&self, router: Router) -> Router {
        router
            .layer(middleware::from_fn(session_middleware))
            .layer(Extension(self.clone()))
    }
}

#[derive(Default)]
struct SessionSlot {
    sid: Option<String>,
    data: Map<String, Value>,
    changed: bool,
    destroyed: bool,
}

/// Request-scoped view of the caller's session.
#[derive(Clone, Default)]
pub struct SessionHandle {
    slot: Arc<Mutex<SessionSlot>>,
}

impl SessionHandle {
    fn loaded(session: Option<Session>) -> Self {
        let slot = match session {
            Some(session) => SessionSlot {
                sid: Some(session.sid),
                data: match session.data {
                    Value::Object(map) => map,
                    _ => Map::new(),
                },
                ..Default::default()
            },
            None => SessionSlot::default(),
        };
        Self {
            slot: Arc::new(Mutex::new(slot)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.slot.lock().data.get(key).cloned()
    }

    pub fn insert(&self, key: &str, value: impl Into<Value>) {
        let mut slot = self.slot.lock();
        slot.data.insert(key.to_string(), value.into());
        slot.changed = true;
        slot.destroyed = false;
    }

    pub fn data(&self) -> Map<String, Value> {
        self.slot.lock().data.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().data.is_empty()
    }

    /// Drop the session from the store and clear the cookie.
    pub fn destroy(&self) {
        let mut slot = self.slot.lock();
        slot.data.clear();
        slot.changed = false;
        slot.destroyed = true;
    }
}

fn session_cookie(req: &Request<Body>) -> Option<&str> {
    req.headers()
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
}

fn set_cookie(response: &mut Response, value: &str, max_age: Duration) {
    let cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE,
        value,
        max_age.as_secs()
    );
    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        Err(e) => tracing::error!(category = "auth", "invalid session cookie: {}", e),
    }
}

async fn session_middleware(
    Extension(config): Extension<SessionConfig>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let sid = session_cookie(&req)
        .and_then(|value| config.verify(value))
        .map(str::to_string);

    let session = match &sid {
        Some(sid) => match config.store.get(sid).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(category = "auth", "session lookup failed: {}", e);
                None
            }
        },
        None => None,
    };

    let handle = SessionHandle::loaded(session);
    req.extensions_mut().insert(handle.clone());
    let mut response = next.run(req).await;

    let (sid, data, changed, destroyed) = {
        let slot = handle.slot.lock();
        (slot.sid.clone(), slot.data.clone(), slot.changed, slot.destroyed)
    };

    if destroyed {
        if let Some(sid) = &sid {
            if let Err(e) = config.store.destroy(sid).await {
                tracing::warn!(category = "auth", "session destroy failed: {}", e);
            }
        }
        set_cookie(&mut response, "", Duration::ZERO);
    } else if changed {
        let sid = sid.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let session = Session {
            sid: sid.clone(),
            data: Value::Object(data),
            expires_at: unix_millis() + config.ttl.as_millis() as u64,
        };
        match config.store.set(session).await {
            Ok(()) => set_cookie(&mut response, &config.cookie_value(&sid), config.ttl),
            Err(e) => tracing::error!(category = "auth", "session save failed: {}", e),
        }
    }

    response
}
