use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

use routed_core::cookie::Cookie;
use routed_core::middleware::BoxFuture;
use routed_core::Context;
use routed_security::{CodecMode, CookieCodec};

use crate::session::Session;
use crate::store::{SessionError, SessionStore};

/// In-memory session store with a signed id cookie. The reference store
/// for tests and single-process applications.
pub struct MemoryStore {
    sessions: DashMap<String, (HashMap<String, Value>, DateTime<Utc>)>,
    codec: CookieCodec,
}

impl MemoryStore {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            sessions: DashMap::new(),
            codec: CookieCodec::new(secret, CodecMode::Signed),
        }
    }

    pub fn with_codec(secret: &[u8], mode: CodecMode) -> Self {
        Self {
            sessions: DashMap::new(),
            codec: CookieCodec::new(secret, mode),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn id_from_cookie(&self, ctx: &Context, name: &str) -> Option<String> {
        let token = ctx.cookie(name)?;
        let payload = self.codec.decode(&token).ok()?;
        let value: Value = serde_json::from_str(&payload).ok()?;
        value.get("id")?.as_str().map(|s| s.to_string())
    }

    fn cookie_for(&self, session: &Session) -> Result<Cookie, SessionError> {
        let payload = serde_json::json!({ "id": session.id() }).to_string();
        let token = self
            .codec
            .encode(&payload)
            .map_err(|e| SessionError::Store(e.to_string()))?;
        let options = &session.options;
        let mut cookie = Cookie::new(session.name(), token).with_path(options.path.clone());
        if let Some(domain) = &options.domain {
            cookie = cookie.with_domain(domain.clone());
        }
        if let Some(max_age) = options.max_age {
            cookie = cookie.with_max_age(max_age);
        }
        cookie = cookie.with_same_site(options.same_site);
        if options.secure {
            cookie = cookie.secure();
        }
        if options.http_only {
            cookie = cookie.http_only();
        }
        if options.partitioned {
            cookie = cookie.partitioned();
        }
        Ok(cookie)
    }
}

impl SessionStore for MemoryStore {
    fn read<'a>(
        &'a self,
        ctx: &'a Context,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Session, SessionError>> {
        let result = (|| {
            if let Some(id) = self.id_from_cookie(ctx, name) {
                if let Some(entry) = self.sessions.get(&id) {
                    let (values, created_at) = entry.value();
                    return Ok(Session::restored(id.clone(), name, values.clone(), *created_at));
                }
            }
            // no cookie, tampered cookie, or expired server state
            Ok(Session::new(name))
        })();
        Box::pin(async move { result })
    }

    fn write<'a>(
        &'a self,
        ctx: &'a mut Context,
        session: &'a Session,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        let result = (|| {
            if session.is_destroyed() {
                self.sessions.remove(session.id());
                let mut expired = Cookie::expired(session.name());
                expired.path = Some(session.options.path.clone());
                ctx.set_cookie(expired);
                return Ok(());
            }

            self.sessions.insert(
                session.id().to_string(),
                (session.values().clone(), session.created_at()),
            );
            let cookie = self.cookie_for(session)?;
            ctx.set_cookie(cookie);
            Ok(())
        })();
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routed_core::http::{Body, Method};

    fn ctx_with_cookie(cookie: Option<&str>) -> Context {
        let mut builder = http::Request::builder().method(Method::GET).uri("/");
        if let Some(cookie) = cookie {
            builder = builder.header("cookie", cookie);
        }
        Context::from_request(
            builder.body(Body::empty()).unwrap(),
            "127.0.0.1:9000".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn read_without_cookie_is_a_fresh_session() {
        let store = MemoryStore::new(b"secret");
        let ctx = ctx_with_cookie(None);
        let session = store.read(&ctx, "sid").await.unwrap();
        assert!(session.is_new());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let store = MemoryStore::new(b"secret");

        let mut ctx = ctx_with_cookie(None);
        let mut session = Session::new("sid");
        session.insert("user", "alice");
        store.write(&mut ctx, &session).await.unwrap();

        let set_cookie = ctx
            .finalize()
            .headers()
            .get(routed_core::http::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let pair = set_cookie.split(';').next().unwrap().to_string();

        let ctx = ctx_with_cookie(Some(&pair));
        let restored = store.read(&ctx, "sid").await.unwrap();
        assert!(!restored.is_new());
        assert_eq!(restored.get::<String>("user"), Some("alice".to_string()));
    }

    #[tokio::test]
    async fn tampered_cookie_yields_fresh_session() {
        let store = MemoryStore::new(b"secret");

        let mut ctx = ctx_with_cookie(None);
        let session = Session::new("sid");
        store.write(&mut ctx, &session).await.unwrap();
        let set_cookie = ctx
            .finalize()
            .headers()
            .get(routed_core::http::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let pair = set_cookie.split(';').next().unwrap().to_string();
        let tampered = format!("{}x", pair);

        let ctx = ctx_with_cookie(Some(&tampered));
        let restored = store.read(&ctx, "sid").await.unwrap();
        assert!(restored.is_new());
    }

    #[tokio::test]
    async fn destroyed_sessions_are_deleted() {
        let store = MemoryStore::new(b"secret");
        let mut ctx = ctx_with_cookie(None);
        let mut session = Session::new("sid");
        session.insert("k", 1);
        store.write(&mut ctx, &session).await.unwrap();
        assert_eq!(store.len(), 1);

        session.destroy();
        let mut ctx = ctx_with_cookie(None);
        store.write(&mut ctx, &session).await.unwrap();
        assert_eq!(store.len(), 0);
    }
}
