//! Method router for server-to-client traffic.
//!
//! Requests are served through cloneable [`tower`] services so the
//! connection can run several handlers concurrently while `$/cancelRequest`
//! stays able to abort any of them. Notification handlers are plain async
//! closures dispatched strictly in arrival order by the connection's read
//! loop.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tower::util::{BoxCloneService, ServiceExt};
use tower::service_fn;
use tracing::{debug, warn};

use crate::jsonrpc::{Error, ErrorCode, Request, Response};

type RequestService = BoxCloneService<Request, Option<Response>, Infallible>;
type NotificationHandler = dyn Fn(Option<Value>) -> BoxFuture<'static, ()> + Send + Sync;

/// Routes inbound requests and notifications to registered handlers.
pub(crate) struct Router {
    requests: Mutex<HashMap<&'static str, RequestService>>,
    notifications: HashMap<&'static str, Arc<NotificationHandler>>,
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Self {
        Router {
            requests: Mutex::new(HashMap::new()),
            notifications: HashMap::new(),
        }
    }

    /// Registers a handler for the request method `R`.
    pub fn request<R, F, Fut>(&mut self, callback: F) -> &mut Self
    where
        R: lsp_types::request::Request,
        F: Fn(R::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::jsonrpc::Result<R::Result>> + Send + 'static,
    {
        let callback = Arc::new(callback);
        let service = service_fn(move |req: Request| {
            let callback = callback.clone();
            async move {
                let (_, id, params) = req.into_parts();
                let id = match id {
                    Some(id) => id,
                    None => return Ok(None),
                };

                let params = match parse_params::<R::Params>(params) {
                    Ok(params) => params,
                    Err(err) => return Ok(Some(Response::from_error(id, err))),
                };

                let result = callback(params).await.and_then(|value| {
                    serde_json::to_value(value).map_err(|e| Error {
                        code: ErrorCode::InternalError,
                        message: e.to_string(),
                        data: None,
                    })
                });

                Ok::<_, Infallible>(Some(Response::from_parts(id, result)))
            }
        });

        self.requests
            .lock()
            .expect("router requests poisoned")
            .insert(R::METHOD, BoxCloneService::new(service));
        self
    }

    /// Registers a handler for the notification method `N`.
    pub fn notification<N, F, Fut>(&mut self, callback: F) -> &mut Self
    where
        N: lsp_types::notification::Notification,
        F: Fn(N::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback = Arc::new(callback);
        let handler: Arc<NotificationHandler> = Arc::new(move |params| {
            match parse_params::<N::Params>(params) {
                Ok(params) => callback(params).boxed(),
                Err(err) => {
                    warn!("invalid params for {}: {}", N::METHOD, err);
                    future::ready(()).boxed()
                }
            }
        });

        self.notifications.insert(N::METHOD, handler);
        self
    }

    /// Dispatches a request to its handler, or produces a "method not found"
    /// error response.
    pub fn dispatch_request(&self, req: Request) -> BoxFuture<'static, Option<Response>> {
        let service = self
            .requests
            .lock()
            .expect("router requests poisoned")
            .get(req.method())
            .cloned();
        match service {
            Some(service) => {
                async move {
                    match service.oneshot(req).await {
                        Ok(response) => response,
                        Err(infallible) => match infallible {},
                    }
                }
                .boxed()
            }
            None => {
                let (method, id, _) = req.into_parts();
                future::ready(id.map(|id| {
                    let mut error = Error::method_not_found();
                    error.data = Some(Value::from(method.into_owned()));
                    Response::from_error(id, error)
                }))
                .boxed()
            }
        }
    }

    /// Dispatches a notification to its handler; unknown methods are dropped.
    pub fn dispatch_notification(&self, req: Request) -> BoxFuture<'static, ()> {
        let (method, _, params) = req.into_parts();
        match self.notifications.get(method.as_ref()) {
            Some(handler) => handler(params),
            None => {
                if !method.starts_with("$/") {
                    debug!("unhandled notification: {}", method);
                }
                future::ready(()).boxed()
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let requests = self.requests.lock().expect("router requests poisoned");
        f.debug_struct("Router")
            .field("requests", &requests.keys())
            .field("notifications", &self.notifications.keys())
            .finish()
    }
}

fn parse_params<P: DeserializeOwned>(params: Option<Value>) -> crate::jsonrpc::Result<P> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| Error::invalid_params(e.to_string()))
}
