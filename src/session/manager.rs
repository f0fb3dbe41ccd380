//! Obtains valid sessions, transparently (re)authenticating.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use reqwest::header::{COOKIE, LOCATION, SET_COOKIE};
use reqwest::{Client, Method, StatusCode};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use url::Url;

use super::{CredentialsProvider, Session, SessionHandle, SessionStore};
use crate::error::SessionError;

const LOGIN_FORM_PATH: &str = "/customer/account/login/";
const LOGIN_POST_PATH: &str = "/customer/account/loginPost/";
const MAX_LOGIN_REDIRECTS: usize = 4;

fn form_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"name="form_key"\s+type="hidden"\s+value="([^"]+)""#)
            .expect("form key pattern is valid")
    })
}

type SessionKey = (String, Option<String>);

/// Hands out valid sessions for (host, customer group) pairs.
///
/// An in-process map deduplicates handles so all jobs of a batch share
/// one session per key, and the lock held across authentication makes
/// session creation single-flight within the process. Cross-process
/// sharing goes through the [`SessionStore`].
pub struct SessionManager {
    store: SessionStore,
    credentials: Arc<dyn CredentialsProvider>,
    client: Client,
    sessions: Mutex<HashMap<SessionKey, SessionHandle>>,
}

impl SessionManager {
    pub fn new(store: SessionStore, credentials: Arc<dyn CredentialsProvider>, client: Client) -> Self {
        Self {
            store,
            credentials,
            client,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Get a valid session for the key, creating and authenticating a
    /// fresh one when none exists, the existing one is invalid, or
    /// `reauthorize` is requested.
    ///
    /// Authentication serializes on the key's own write lock, so
    /// concurrent callers for one key trigger a single login while
    /// other keys proceed independently.
    pub async fn get_session(
        &self,
        scheme: &str,
        host: &str,
        customer_group: Option<&str>,
        reauthorize: bool,
    ) -> Result<SessionHandle, SessionError> {
        let key: SessionKey = (host.to_string(), customer_group.map(str::to_string));

        // The map lock is only held long enough to hand out the handle.
        let handle = {
            let mut sessions = self.sessions.lock().await;
            sessions
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(RwLock::new(Session::new(
                        host,
                        customer_group.map(str::to_string),
                    )))
                })
                .clone()
        };

        if !reauthorize && handle.read().await.is_valid(Utc::now()) {
            return Ok(handle);
        }

        let mut session = handle.write().await;

        // Someone else may have authenticated while we waited for the
        // write lock.
        if !reauthorize {
            if session.is_valid(Utc::now()) {
                return Ok(handle.clone());
            }

            if let Some(loaded) = self.store.load(host, customer_group)? {
                if loaded.is_valid(Utc::now()) {
                    debug!(host, ?customer_group, "reusing persisted session");
                    *session = loaded;
                    return Ok(handle.clone());
                }
            }
        }

        // Stale on disk and in memory; start over.
        self.store.delete(host, customer_group)?;
        self.authenticate(scheme, &mut session).await?;

        // Persist right away so concurrent processes can reuse it.
        self.store.save(&session)?;
        info!(host, ?customer_group, "session authenticated");

        drop(session);
        Ok(handle)
    }

    /// Flip a session invalid and persist that immediately.
    pub async fn invalidate(&self, handle: &SessionHandle) -> Result<(), SessionError> {
        let mut session = handle.write().await;
        session.invalidate();
        self.store.save(&session)
    }

    async fn authenticate(&self, scheme: &str, session: &mut Session) -> Result<(), SessionError> {
        session.reset();
        debug!(host = session.host(), "bootstrapping session via login form");

        let login_form_url = page_url(scheme, session.host(), LOGIN_FORM_PATH)?;
        let (status, body) = self
            .send_following_redirects(session, Method::GET, login_form_url, None)
            .await?;

        if status != StatusCode::OK {
            return Err(SessionError::LoginPageUnavailable {
                host: session.host().to_string(),
                status: status.as_u16(),
            });
        }

        let group = match session.customer_group() {
            // The login form request alone creates the visitor session, so
            // having its cookie is all an anonymous session needs.
            None => return Ok(()),
            Some(group) => group.to_string(),
        };

        let form_key = form_key_regex()
            .captures(&body)
            .map(|captures| captures[1].trim().to_string())
            .ok_or_else(|| SessionError::FormKeyNotFound {
                host: session.host().to_string(),
            })?;

        let creds = self.credentials.credentials(&group)?;
        let params = vec![
            ("form_key".to_string(), form_key),
            ("login[username]".to_string(), creds.username),
            ("login[password]".to_string(), creds.password),
        ];

        let login_post_url = page_url(scheme, session.host(), LOGIN_POST_PATH)?;
        let (status, _) = self
            .send_following_redirects(session, Method::POST, login_post_url, Some(&params))
            .await?;

        if status != StatusCode::OK {
            return Err(SessionError::AuthenticationFailed {
                host: session.host().to_string(),
                customer_group: group,
                detail: format!("login returned status {}", status.as_u16()),
            });
        }

        // The vary cookie is the proof of login; without it the origin
        // treated us as a guest.
        if !session.is_valid(Utc::now()) {
            return Err(SessionError::AuthenticationFailed {
                host: session.host().to_string(),
                customer_group: group,
                detail: "no vary cookie received after login".to_string(),
            });
        }

        Ok(())
    }

    /// Issue a request carrying the session's cookies, absorbing
    /// `Set-Cookie` on every hop and following up to
    /// `MAX_LOGIN_REDIRECTS` redirects (a redirected POST is retried as
    /// GET, as browsers do).
    async fn send_following_redirects(
        &self,
        session: &mut Session,
        method: Method,
        url: Url,
        form: Option<&[(String, String)]>,
    ) -> Result<(StatusCode, String), SessionError> {
        let host = session.host().to_string();
        let transport_err = |source| SessionError::Transport {
            host: host.clone(),
            source,
        };

        let mut method = method;
        let mut url = url;
        let mut form = form;

        for _ in 0..=MAX_LOGIN_REDIRECTS {
            let mut request = self.client.request(method.clone(), url.clone());

            if let Some(header) = session.cookie_header(Utc::now()) {
                request = request.header(COOKIE, header);
            }
            if let Some(params) = form {
                request = request.form(&params);
            }

            let response = request.send().await.map_err(transport_err)?;

            let now = Utc::now();
            for value in response.headers().get_all(SET_COOKIE) {
                if let Ok(value) = value.to_str() {
                    session.apply_set_cookie(value, now);
                }
            }

            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| url.join(v).ok());

                match location {
                    Some(next) => {
                        debug!(from = %url, to = %next, "following login redirect");
                        url = next;
                        method = Method::GET;
                        form = None;
                        continue;
                    }
                    None => return Ok((status, String::new())),
                }
            }

            let body = response.text().await.map_err(transport_err)?;
            return Ok((status, body));
        }

        Err(SessionError::TooManyRedirects {
            host: session.host().to_string(),
        })
    }
}

fn page_url(scheme: &str, host: &str, path: &str) -> Result<Url, SessionError> {
    Url::parse(&format!("{scheme}://{host}{path}")).map_err(|_| SessionError::InvalidHost {
        host: host.to_string(),
    })
}
