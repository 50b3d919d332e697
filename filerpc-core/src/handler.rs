//! Endpoint handlers: what the server invokes for an accepted request.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::identity::RequestId;
use crate::protocol::{Request, StatusCode};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Shared application state handed to every handler of a server.
pub type State = Arc<dyn Any + Send + Sync>;

/// Everything a handler may want to know about the request besides its body.
#[derive(Clone)]
pub struct Context {
    request_id: RequestId,
    sender: String,
    method: String,
    headers: BTreeMap<String, String>,
    params: HashMap<String, String>,
    state: Option<State>,
}

impl Context {
    pub(crate) fn new(
        request: &Request,
        params: HashMap<String, String>,
        state: Option<State>,
    ) -> Self {
        Self {
            request_id: request.id(),
            sender: request.sender().to_string(),
            method: request.method.clone(),
            headers: request.envelope.headers.clone(),
            params,
            state,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Identity that wrote the request. Already authorized by the time a handler runs.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Value captured by a `{name}` segment of the route pattern.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// The server's state, if it is a `T`.
    pub fn state<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.state.clone()?.downcast::<T>().ok()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("request_id", &self.request_id)
            .field("sender", &self.sender)
            .field("method", &self.method)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// What a handler produces. Becomes the response envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// JSON body wrapper, both for decoding requests and encoding replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

/// Decodes a request body into the type a handler declares.
pub trait FromBody: Sized {
    fn from_body(body: &[u8]) -> Result<Self, HandlerError>;
}

impl FromBody for Vec<u8> {
    fn from_body(body: &[u8]) -> Result<Self, HandlerError> {
        Ok(body.to_vec())
    }
}

impl FromBody for String {
    fn from_body(body: &[u8]) -> Result<Self, HandlerError> {
        String::from_utf8(body.to_vec())
            .map_err(|_| HandlerError::new(StatusCode::BAD_REQUEST, "body is not valid UTF-8"))
    }
}

/// Ignores the body.
impl FromBody for () {
    fn from_body(_: &[u8]) -> Result<Self, HandlerError> {
        Ok(())
    }
}

impl<T: DeserializeOwned> FromBody for Json<T> {
    fn from_body(body: &[u8]) -> Result<Self, HandlerError> {
        serde_json::from_slice(body).map(Json).map_err(|e| {
            HandlerError::new(StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}"))
        })
    }
}

pub trait IntoReply {
    fn into_reply(self) -> Result<Reply, HandlerError>;
}

impl IntoReply for Reply {
    fn into_reply(self) -> Result<Reply, HandlerError> {
        Ok(self)
    }
}

impl IntoReply for Vec<u8> {
    fn into_reply(self) -> Result<Reply, HandlerError> {
        Ok(Reply::ok(self))
    }
}

impl IntoReply for String {
    fn into_reply(self) -> Result<Reply, HandlerError> {
        Ok(Reply::ok(self).with_header("content-type", "text/plain; charset=utf-8"))
    }
}

impl IntoReply for &'static str {
    fn into_reply(self) -> Result<Reply, HandlerError> {
        self.to_string().into_reply()
    }
}

impl IntoReply for () {
    fn into_reply(self) -> Result<Reply, HandlerError> {
        Ok(Reply::ok(Vec::new()))
    }
}

impl<T: Serialize> IntoReply for Json<T> {
    fn into_reply(self) -> Result<Reply, HandlerError> {
        let body = serde_json::to_vec(&self.0)?;
        Ok(Reply::ok(body).with_header("content-type", "application/json"))
    }
}

/// A handler's failure.
///
/// Built with [`HandlerError::new`] the message is meant for the caller. Converted from any
/// other error with `?`, it becomes a 500 whose detail stays on the server unless the server
/// is configured to expose it.
#[derive(Debug)]
pub struct HandlerError {
    status: StatusCode,
    message: Option<String>,
    source: Option<anyhow::Error>,
}

impl HandlerError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            source: None,
        }
    }

    pub fn internal(source: impl Into<anyhow::Error>) -> Self {
        Self {
            status: StatusCode::INTERNAL_ERROR,
            message: None,
            source: Some(source.into()),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Render as the reply written back to the caller.
    pub fn into_reply(self, expose_internal: bool) -> Reply {
        let body = match (self.message, self.source) {
            (Some(message), _) => message,
            (None, Some(source)) if expose_internal => format!("{source:#}"),
            _ => "internal server error".to_string(),
        };
        Reply::new(self.status, body)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.message, &self.source) {
            (Some(message), _) => write!(f, "{}: {message}", self.status),
            (None, Some(source)) => write!(f, "{}: {source:#}", self.status),
            (None, None) => write!(f, "{}", self.status),
        }
    }
}

impl<E> From<E> for HandlerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::internal(err)
    }
}

/// Serves one route.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request, ctx: Context) -> BoxFuture<Result<Reply, HandlerError>>;
}

/// Handler built from an async function taking a decoded body and the context.
pub struct HandlerFn<F, T> {
    f: F,
    _body: PhantomData<fn() -> T>,
}

/// Wrap `f` as a [`Handler`]. The body is decoded as `T` before `f` runs; a body that does
/// not decode is answered with 400 and `f` is never called.
pub fn handler_fn<F, Fut, T, R>(f: F) -> HandlerFn<F, T>
where
    F: Fn(T, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    T: FromBody + 'static,
    R: IntoReply + 'static,
{
    HandlerFn {
        f,
        _body: PhantomData,
    }
}

impl<F, Fut, T, R> Handler for HandlerFn<F, T>
where
    F: Fn(T, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    T: FromBody + 'static,
    R: IntoReply + 'static,
{
    fn call(&self, request: Request, ctx: Context) -> BoxFuture<Result<Reply, HandlerError>> {
        let body = match T::from_body(request.body()) {
            Ok(body) => body,
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        let fut = (self.f)(body, ctx);
        Box::pin(async move { fut.await?.into_reply() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct Greeting {
        name: String,
    }

    fn request(body: &[u8]) -> Request {
        Request::new(
            "alice@x",
            Address::rpc("bob@x", "chat", "greet").unwrap(),
            "greet",
            body,
            Duration::from_secs(60),
        )
        .with_header("x-trace", "7")
    }

    fn context(req: &Request) -> Context {
        Context::new(req, HashMap::new(), None)
    }

    #[test]
    fn body_decoding() {
        assert_eq!(Vec::<u8>::from_body(b"\x00\x01").unwrap(), vec![0, 1]);
        assert_eq!(String::from_body("héllo".as_bytes()).unwrap(), "héllo");
        assert_eq!(
            String::from_body(&[0xff]).unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
        let Json(g) = Json::<Greeting>::from_body(br#"{"name":"bob"}"#).unwrap();
        assert_eq!(g.name, "bob");
        assert_eq!(
            Json::<Greeting>::from_body(b"nope").unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn reply_conversions() {
        let text = "hi".to_string().into_reply().unwrap();
        assert_eq!(text.status, StatusCode::OK);
        assert_eq!(text.body, b"hi");
        let json = Json(Greeting { name: "x".into() }).into_reply().unwrap();
        assert_eq!(json.headers["content-type"], "application/json");
        assert!(().into_reply().unwrap().body.is_empty());
    }

    #[test]
    fn internal_errors_are_hidden_unless_exposed() {
        let err: HandlerError = anyhow::anyhow!("database password is hunter2").into();
        assert_eq!(err.status(), StatusCode::INTERNAL_ERROR);
        let hidden = err.into_reply(false);
        assert_eq!(hidden.body, b"internal server error");

        let err: HandlerError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.into_reply(true).body, b"disk full");

        let public = HandlerError::new(StatusCode::NOT_FOUND, "no such user");
        assert_eq!(public.into_reply(false).body, b"no such user");
    }

    #[test]
    fn context_exposes_request_details() {
        let req = request(b"");
        let mut params = HashMap::new();
        params.insert("id".to_string(), "42".to_string());
        let state: State = Arc::new(7u32);
        let ctx = Context::new(&req, params, Some(state));
        assert_eq!(ctx.sender(), "alice@x");
        assert_eq!(ctx.method(), "greet");
        assert_eq!(ctx.header("x-trace"), Some("7"));
        assert_eq!(ctx.param("id"), Some("42"));
        assert_eq!(ctx.state::<u32>().as_deref(), Some(&7));
        assert!(ctx.state::<String>().is_none());
    }

    #[tokio::test]
    async fn handler_fn_decodes_then_runs() {
        let greet = handler_fn(|Json(g): Json<Greeting>, ctx: Context| async move {
            Ok::<_, HandlerError>(format!("hello {} from {}", g.name, ctx.sender()))
        });
        let req = request(br#"{"name":"bob"}"#);
        let reply = greet.call(req.clone(), context(&req)).await.unwrap();
        assert_eq!(reply.body, b"hello bob from alice@x");

        let bad = request(b"{");
        let err = greet.call(bad.clone(), context(&bad)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn question_mark_maps_to_internal_error() {
        let parse = handler_fn(|body: String, _ctx: Context| async move {
            let n: u32 = body.parse()?;
            Ok::<_, HandlerError>((n * 2).to_string())
        });
        let req = request(b"21");
        assert_eq!(
            parse.call(req.clone(), context(&req)).await.unwrap().body,
            b"42"
        );
        let req = request(b"x");
        let err = parse.call(req.clone(), context(&req)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_ERROR);
    }
}
